use crate::retrieve::{DataFormat, RetrievalScope, RetrieveRequest};
use crate::types::{is_valid_uid, UI};
use crate::AppState;
use axum::extract::rejection::PathRejection;
use axum::extract::{FromRef, FromRequestParts, Path};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::warn;

/// Path parameters of a WADO-RS resource.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceQuery {
	#[serde(rename = "study")]
	pub study_instance_uid: UI,
	#[serde(rename = "series")]
	pub series_instance_uid: Option<UI>,
	#[serde(rename = "instance")]
	pub sop_instance_uid: Option<UI>,
}

impl ResourceQuery {
	/// The first UID that is not a valid DICOM UID.
	fn invalid_uid(&self) -> Option<&str> {
		std::iter::once(&self.study_instance_uid)
			.chain(&self.series_instance_uid)
			.chain(&self.sop_instance_uid)
			.map(String::as_str)
			.find(|uid| !is_valid_uid(uid))
	}

	pub fn into_request(self, format: DataFormat) -> RetrieveRequest {
		RetrieveRequest {
			scope: RetrievalScope {
				study_instance_uid: self.study_instance_uid,
				series_instance_uid: self.series_instance_uid,
				sop_instance_uid: self.sop_instance_uid,
			},
			format,
		}
	}
}

/// A [`ResourceQuery`] whose UIDs have been validated.
///
/// UIDs become path components of the cache and the multipart boundary, so anything but digits
/// and dots is rejected with 400 Bad Request.
pub struct RetrieveInstanceRequest {
	pub query: ResourceQuery,
}

impl<S> FromRequestParts<S> for RetrieveInstanceRequest
where
	AppState: FromRef<S>,
	S: Send + Sync,
{
	type Rejection = Response;

	async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		let Path(query): Path<ResourceQuery> = Path::from_request_parts(parts, state)
			.await
			.map_err(PathRejection::into_response)?;

		if let Some(uid) = query.invalid_uid() {
			warn!(uid, "Rejected request with invalid UID");
			return Err((StatusCode::BAD_REQUEST, format!("Invalid UID: {uid}")).into_response());
		}

		Ok(Self { query })
	}
}
