use super::RetrievalScope;
use crate::backend::{FetchError, FetchOrchestrator, FetchRequest};
use std::sync::Arc;
use tracing::info;

/// Fetches a whole scope from the remote source after a cache miss.
///
/// There is no delta fetch: a single missing instance re-fetches the entire scope, and two
/// concurrent misses of the same scope fetch twice.
pub struct FetchTrigger {
	orchestrator: Arc<dyn FetchOrchestrator>,
}

impl FetchTrigger {
	pub fn new(orchestrator: Arc<dyn FetchOrchestrator>) -> Self {
		Self { orchestrator }
	}

	pub async fn ensure_fetched(&self, scope: &RetrievalScope) -> Result<(), FetchError> {
		let request = FetchRequest {
			study_instance_uid: scope.study_instance_uid.clone(),
			series_instance_uid: scope.series_instance_uid.clone().unwrap_or_default(),
			sop_instance_uid: scope.sop_instance_uid.clone().unwrap_or_default(),
			level: scope.query_level(),
		};
		info!(
			study_instance_uid = %request.study_instance_uid,
			level = %request.level,
			"Fetching scope from remote source"
		);
		self.orchestrator.fetch(&request).await
	}
}
