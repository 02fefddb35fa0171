use super::RetrievalScope;
use crate::backend::{MetadataQuery, QueryError, QueryFilters};
use crate::types::{is_valid_uid, QueryRetrieveLevel, UI};
use crate::utils::merge::merge_all;
use futures::future::join_all;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// DICOM JSON key of SOP Instance UID (0008,0018).
const SOP_INSTANCE_UID: &str = "00080018";

/// Outcome of [`CacheChecker::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
	/// Whether every object of the scope is present in the cache.
	pub hit: bool,
	/// Instances the metadata query reported for a directory scope. Empty for single objects.
	pub expected_instances: Vec<UI>,
	pub is_directory_scope: bool,
	/// `<storage>/<study>` or `<storage>/<study>/<instance>`.
	pub target_path: PathBuf,
}

/// Decides whether the cache holds a complete answer for a scope.
pub struct CacheChecker {
	storage: PathBuf,
	query: Arc<dyn MetadataQuery>,
}

impl CacheChecker {
	pub fn new(storage: PathBuf, query: Arc<dyn MetadataQuery>) -> Self {
		Self { storage, query }
	}

	#[instrument(skip_all, fields(study_instance_uid = %scope.study_instance_uid))]
	pub async fn check(&self, scope: &RetrievalScope) -> Result<CacheStatus, QueryError> {
		let study_path = self.storage.join(&scope.study_instance_uid);
		let target_path = match &scope.sop_instance_uid {
			Some(sop_instance_uid) => study_path.join(sop_instance_uid),
			None => study_path.clone(),
		};

		// A missing target is fetched as a directory.
		let is_directory_scope = tokio::fs::metadata(&target_path)
			.await
			.map_or(true, |metadata| metadata.is_dir());

		if !is_directory_scope {
			let hit = tokio::fs::try_exists(&target_path).await.unwrap_or(false);
			return Ok(CacheStatus {
				hit,
				expected_instances: Vec::new(),
				is_directory_scope,
				target_path,
			});
		}

		let filters = QueryFilters {
			study_instance_uid: scope.study_instance_uid.clone(),
			series_instance_uid: scope.series_instance_uid.clone().unwrap_or_default(),
			sop_instance_uid: scope.sop_instance_uid.clone().unwrap_or_default(),
		};
		let partials = self.query.find(QueryRetrieveLevel::Image, &filters).await?;
		let expected_instances = expected_instances(&merge_all(partials));

		let checks = expected_instances
			.iter()
			.map(|uid| tokio::fs::try_exists(study_path.join(uid)));
		let hit = join_all(checks)
			.await
			.into_iter()
			.all(|exists| exists.unwrap_or(false));

		debug!(
			hit,
			expected = expected_instances.len(),
			"Checked cache for directory scope"
		);
		Ok(CacheStatus {
			hit,
			expected_instances,
			is_directory_scope,
			target_path,
		})
	}
}

/// Collects the SOP Instance UIDs of merged DICOM JSON results, skipping values that are not
/// valid UIDs.
fn expected_instances(results: &Value) -> Vec<UI> {
	let Some(results) = results.as_array() else {
		return Vec::new();
	};

	results
		.iter()
		.filter_map(|result| result.get(SOP_INSTANCE_UID)?.get("Value")?.get(0)?.as_str())
		.filter(|uid| {
			let valid = is_valid_uid(uid);
			if !valid {
				warn!(uid, "Ignoring invalid SOP Instance UID in query result");
			}
			valid
		})
		.map(UI::from)
		.collect()
}
