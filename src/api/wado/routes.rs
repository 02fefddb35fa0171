use crate::api::wado::RetrieveInstanceRequest;
use crate::retrieve::{DataFormat, RetrieveResponse};
use crate::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::{error, instrument};

/// HTTP Router for the Retrieve Transaction
/// https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.4
#[rustfmt::skip]
pub fn routes() -> Router<AppState> {
	Router::new()
		// https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.4.html#sect_10.4.1.1.1
		.route("/studies/{study}", get(instances))
		.route("/studies/{study}/series/{series}", get(instances))
		.route("/studies/{study}/series/{series}/instances/{instance}", get(instances))

		// https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.4.html#sect_10.4.1.1.3
		.route("/studies/{study}/rendered", get(rendered))
		.route("/studies/{study}/series/{series}/rendered", get(rendered))
		.route("/studies/{study}/series/{series}/instances/{instance}/rendered", get(rendered))

		// https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.4.html#sect_10.4.1.1.4
		.route("/studies/{study}/thumbnail", get(thumbnail))
		.route("/studies/{study}/series/{series}/thumbnail", get(thumbnail))
		.route("/studies/{study}/series/{series}/instances/{instance}/thumbnail", get(thumbnail))

		// https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.4.html#sect_10.4.1.1.5
		.route("/studies/{study}/bulkdata", get(bulkdata))
		.route("/studies/{study}/series/{series}/bulkdata", get(bulkdata))
		.route("/studies/{study}/series/{series}/instances/{instance}/bulkdata", get(bulkdata))

		// https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.4.html#sect_10.4.1.1.6
		.route("/studies/{study}/pixeldata", get(pixeldata))
		.route("/studies/{study}/series/{series}/pixeldata", get(pixeldata))
		.route("/studies/{study}/series/{series}/instances/{instance}/pixeldata", get(pixeldata))
}

async fn resource(
	state: &AppState,
	request: RetrieveInstanceRequest,
	format: DataFormat,
) -> impl IntoResponse {
	match state.retriever.retrieve(&request.query.into_request(format)).await {
		Ok(RetrieveResponse { content_type, body }) => {
			([(CONTENT_TYPE, content_type)], Body::from(body)).into_response()
		}
		Err(err) => {
			error!("{err:?}");
			(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
		}
	}
}

#[instrument(skip_all)]
async fn instances(
	State(state): State<AppState>,
	request: RetrieveInstanceRequest,
) -> impl IntoResponse {
	resource(&state, request, DataFormat::Default).await
}

#[instrument(skip_all)]
async fn rendered(
	State(state): State<AppState>,
	request: RetrieveInstanceRequest,
) -> impl IntoResponse {
	resource(&state, request, DataFormat::Rendered).await
}

#[instrument(skip_all)]
async fn thumbnail(
	State(state): State<AppState>,
	request: RetrieveInstanceRequest,
) -> impl IntoResponse {
	resource(&state, request, DataFormat::Thumbnail).await
}

#[instrument(skip_all)]
async fn bulkdata(
	State(state): State<AppState>,
	request: RetrieveInstanceRequest,
) -> impl IntoResponse {
	resource(&state, request, DataFormat::BulkData).await
}

#[instrument(skip_all)]
async fn pixeldata(
	State(state): State<AppState>,
	request: RetrieveInstanceRequest,
) -> impl IntoResponse {
	resource(&state, request, DataFormat::PixelData).await
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::{
		FetchError, FetchOrchestrator, FetchRequest, MetadataQuery, QueryError, QueryFilters,
		TranscodeError, Transcoder,
	};
	use crate::config::AppConfig;
	use crate::rendering::{ConvertError, FrameSelection, ImageConverter};
	use crate::retrieve::Retriever;
	use crate::types::QueryRetrieveLevel;
	use async_trait::async_trait;
	use axum::http::Request;
	use serde_json::{json, Value};
	use std::path::Path;
	use std::sync::Arc;
	use tower::ServiceExt;

	/// Reports the single instance `1.2.3.4` of every queried study.
	struct SingleInstance;

	#[async_trait]
	impl MetadataQuery for SingleInstance {
		async fn find(
			&self,
			_level: QueryRetrieveLevel,
			_filters: &QueryFilters,
		) -> Result<Vec<Value>, QueryError> {
			Ok(vec![json!([{ "00080018": { "vr": "UI", "Value": ["1.2.3.4"] } }])])
		}
	}

	struct Offline;

	#[async_trait]
	impl FetchOrchestrator for Offline {
		async fn fetch(&self, _request: &FetchRequest) -> Result<(), FetchError> {
			Err(FetchError::Timeout)
		}
	}

	#[async_trait]
	impl Transcoder for Offline {
		async fn transcode(
			&self,
			_path: &Path,
			_directory: &Path,
			_target: Option<&str>,
		) -> Result<(), TranscodeError> {
			Ok(())
		}
	}

	#[async_trait]
	impl ImageConverter for Offline {
		async fn convert(
			&self,
			_input: &Path,
			_output: &Path,
			_quality: u8,
			_frames: FrameSelection,
		) -> Result<(), ConvertError> {
			Ok(())
		}
	}

	fn router(storage: &Path) -> Router {
		let mut config = AppConfig::new().unwrap();
		config.storage.path = storage.to_path_buf();
		let retriever = Retriever::new(
			&config.storage,
			Arc::new(SingleInstance),
			Arc::new(Offline),
			Arc::new(Offline),
			Arc::new(Offline),
		);
		routes().with_state(AppState {
			retriever: Arc::new(retriever),
		})
	}

	async fn get(router: Router, uri: &str) -> (StatusCode, String, Vec<u8>) {
		let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
		let response = router.oneshot(request).await.unwrap();
		let status = response.status();
		let content_type = response
			.headers()
			.get(CONTENT_TYPE)
			.and_then(|value| value.to_str().ok())
			.unwrap_or_default()
			.to_owned();
		let body = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		(status, content_type, body.to_vec())
	}

	#[tokio::test]
	async fn serves_cached_study() {
		let storage = tempfile::tempdir().unwrap();
		std::fs::create_dir(storage.path().join("1.2")).unwrap();
		std::fs::write(storage.path().join("1.2/1.2.3.4"), b"object").unwrap();

		let (status, content_type, body) = get(router(storage.path()), "/studies/1.2").await;

		assert_eq!(status, StatusCode::OK);
		assert_eq!(
			content_type,
			"multipart/related;type='application/dicom';boundary=1.2"
		);
		assert!(body.starts_with(b"--1.2\r\n"));
		assert!(body.ends_with(b"--1.2--\r\n"));
	}

	#[tokio::test]
	async fn invalid_uid_is_a_bad_request() {
		let storage = tempfile::tempdir().unwrap();

		let (status, _, _) = get(
			router(storage.path()),
			"/studies/1.2/series/%2E%2E/instances/1.2.3.4",
		)
		.await;

		assert_eq!(status, StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn failed_fetch_is_an_internal_error() {
		let storage = tempfile::tempdir().unwrap();

		let (status, _, body) = get(router(storage.path()), "/studies/1.2/thumbnail").await;

		assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
		assert!(!body.is_empty());
	}
}
