//! Collaborators of the retrieve pipeline.
//!
//! The pipeline only depends on the traits in this module. The DIMSE implementations talk to a
//! remote PACS, the transcoder works on the files in the local cache.

use crate::types::{QueryRetrieveLevel, UI};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod dimse;
pub mod transcode;

pub use transcode::{DicomTranscoder, TranscodeError, Transcoder};

/// Matching keys of a metadata query. An empty string is a universal match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilters {
	pub study_instance_uid: UI,
	pub series_instance_uid: UI,
	pub sop_instance_uid: UI,
}

/// Answers attribute searches (QIDO-style) against the remote source.
#[async_trait]
pub trait MetadataQuery: Send + Sync {
	/// Returns partial results. Every item is a JSON array of DICOM JSON objects and callers are
	/// expected to merge them with list concatenation.
	async fn find(
		&self,
		level: QueryRetrieveLevel,
		filters: &QueryFilters,
	) -> Result<Vec<Value>, QueryError>;
}

#[derive(Debug, Error)]
pub enum QueryError {
	#[error("Metadata query timed out")]
	Timeout,
	#[error(transparent)]
	Backend { source: anyhow::Error },
}

/// Identifies what a [`FetchOrchestrator`] should retrieve. Empty UIDs are not part of the
/// identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
	pub study_instance_uid: UI,
	pub series_instance_uid: UI,
	pub sop_instance_uid: UI,
	pub level: QueryRetrieveLevel,
}

/// Populates the local cache from the remote source.
#[async_trait]
pub trait FetchOrchestrator: Send + Sync {
	/// Resolves once the remote source has delivered every matching instance.
	async fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError>;
}

#[derive(Debug, Error)]
pub enum FetchError {
	#[error("Fetch timed out")]
	Timeout,
	#[error("Remote retrieve was canceled")]
	Cancelled,
	#[error("Remote retrieve failed with status {status:#06x}")]
	Failed { status: u16 },
	#[error(transparent)]
	Backend { source: anyhow::Error },
}
