use crate::backend::dimse::association::client::{ClientAssociation, ClientAssociationOptions};
use crate::backend::dimse::association::AssociationError;
use crate::backend::dimse::cfind::{find_identifier, CompositeFindRequest, CompositeFindResponse};
use crate::backend::dimse::{
	next_message_id, DicomMessageReader, DicomMessageWriter, ReadError, StatusType, WriteError,
};
use crate::backend::{MetadataQuery, QueryError, QueryFilters};
use crate::config::PacsConfig;
use crate::types::{Priority, QueryRetrieveLevel, AE, UI, US};
use async_trait::async_trait;
use dicom::dictionary_std::uids;
use dicom::object::InMemDicomObject;
use dicom_json::DicomJson;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, trace};

/// Answers metadata queries with C-FIND against the Study Root information model.
pub struct FindServiceClassUser {
	calling_aet: AE,
	pacs: PacsConfig,
}

impl FindServiceClassUser {
	pub const fn new(calling_aet: AE, pacs: PacsConfig) -> Self {
		Self { calling_aet, pacs }
	}

	const fn timeout(&self) -> Duration {
		Duration::from_millis(self.pacs.find_timeout)
	}

	async fn invoke(&self, identifier: InMemDicomObject) -> Result<Vec<Value>, FindError> {
		let association = ClientAssociation::new(ClientAssociationOptions {
			calling_aet: self.calling_aet.clone(),
			called_aet: self.pacs.aet.clone(),
			abstract_syntax: UI::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND),
			transfer_syntaxes: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
			host: self.pacs.host.clone(),
			port: self.pacs.port,
		})
		.await?;

		let request = CompositeFindRequest {
			message_id: next_message_id(),
			priority: Priority::Medium as US,
			affected_sop_class_uid: UI::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND),
			identifier,
		};
		association
			.write_message(request, None, self.timeout())
			.await?;
		trace!("Sent C-FIND-RQ");

		let mut partials = Vec::new();
		loop {
			let response = association.read_message(self.timeout()).await?;
			let response = CompositeFindResponse::try_from(response)?;
			trace!("Received C-FIND-RSP");

			if let Some(data) = response.data {
				partials.push(to_partial(data)?);
			}

			match StatusType::try_from(response.status).unwrap_or(StatusType::Failure) {
				StatusType::Pending => {}
				StatusType::Success | StatusType::Warning => break,
				StatusType::Failure | StatusType::Cancel => {
					return Err(FindError::Status(response.status));
				}
			}
		}

		debug!(matches = partials.len(), "C-FIND completed");
		Ok(partials)
	}
}

/// Wraps a single match in a JSON array so partial results concatenate when merged.
fn to_partial(data: InMemDicomObject) -> Result<Value, serde_json::Error> {
	let json = serde_json::to_value(DicomJson::from(data))?;
	Ok(Value::Array(vec![json]))
}

#[async_trait]
impl MetadataQuery for FindServiceClassUser {
	#[instrument(skip_all, name = "FIND-SCU", fields(level = %level))]
	async fn find(
		&self,
		level: QueryRetrieveLevel,
		filters: &QueryFilters,
	) -> Result<Vec<Value>, QueryError> {
		let identifier = find_identifier(level, filters);
		tokio::time::timeout(self.timeout(), self.invoke(identifier))
			.await
			.map_err(|_elapsed| QueryError::Timeout)?
			.map_err(QueryError::from)
	}
}

#[derive(Debug, Error)]
pub enum FindError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error("Failed to convert match to DICOM JSON: {0}")]
	Json(#[from] serde_json::Error),
	#[error("C-FIND failed with status {0:#06x}")]
	Status(US),
}

impl From<FindError> for QueryError {
	fn from(err: FindError) -> Self {
		Self::Backend { source: err.into() }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::dictionary_std::tags;
	use serde_json::json;

	#[test]
	fn matches_become_single_item_arrays() {
		let data = InMemDicomObject::from_element_iter([DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from("1.2.3.4"),
		)]);

		let partial = to_partial(data).unwrap();

		assert_eq!(
			partial,
			json!([{ "00080018": { "vr": "UI", "Value": ["1.2.3.4"] } }])
		);
	}

	#[tokio::test]
	async fn unreachable_peer_is_a_backend_error() {
		let user = FindServiceClassUser::new(
			AE::from("WADO-CACHE"),
			PacsConfig {
				aet: AE::from("PACS"),
				host: String::from("127.0.0.1"),
				port: 1,
				find_timeout: 5000,
				move_timeout: 5000,
			},
		);

		let result = user
			.find(QueryRetrieveLevel::Image, &QueryFilters::default())
			.await;

		assert!(matches!(result, Err(QueryError::Backend { .. })));
	}
}
