use crate::backend::dimse::{DicomMessage, ReadError, DATA_SET_EXISTS};
use crate::backend::QueryFilters;
use crate::types::{QueryRetrieveLevel, UI, US};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

pub mod findscu;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_FIND_REQUEST: US = 0x0020;

/// C-FIND-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-2>
pub struct CompositeFindRequest {
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
}

impl From<CompositeFindRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeFindRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.identifier),
			presentation_context_id: None,
		}
	}
}

/// C-FIND-RSP
#[derive(Debug)]
pub struct CompositeFindResponse {
	pub status: US,
	pub data: Option<InMemDicomObject>,
}

impl TryFrom<DicomMessage> for CompositeFindResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let status = message
			.status()
			.ok_or(ReadError::MissingAttribute(tags::STATUS))?;

		Ok(Self {
			status,
			data: message.data,
		})
	}
}

/// Builds the query identifier. Empty UIDs are kept as universal matches, so the response
/// includes them as return keys.
pub fn find_identifier(level: QueryRetrieveLevel, filters: &QueryFilters) -> InMemDicomObject {
	InMemDicomObject::from_element_iter([
		DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, PrimitiveValue::from(level)),
		DataElement::new(
			tags::STUDY_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(filters.study_instance_uid.as_str()),
		),
		DataElement::new(
			tags::SERIES_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(filters.series_instance_uid.as_str()),
		),
		DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			PrimitiveValue::from(filters.sop_instance_uid.as_str()),
		),
	])
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn identifier_contains_level_and_keys() {
		let filters = QueryFilters {
			study_instance_uid: UI::from("1.2.3"),
			series_instance_uid: UI::new(),
			sop_instance_uid: UI::new(),
		};

		let identifier = find_identifier(QueryRetrieveLevel::Image, &filters);

		let level = identifier.get(tags::QUERY_RETRIEVE_LEVEL).unwrap();
		assert_eq!(level.to_str().unwrap(), "IMAGE");
		let study = identifier.get(tags::STUDY_INSTANCE_UID).unwrap();
		assert_eq!(study.to_str().unwrap(), "1.2.3");
		let series = identifier.get(tags::SERIES_INSTANCE_UID).unwrap();
		assert_eq!(series.to_str().unwrap(), "");
		assert!(identifier.get(tags::SOP_INSTANCE_UID).is_some());
	}

	#[test]
	fn response_requires_status() {
		let message = DicomMessage {
			command: InMemDicomObject::new_empty(),
			data: None,
			presentation_context_id: Some(1),
		};

		let response = CompositeFindResponse::try_from(message);

		assert!(matches!(
			response,
			Err(ReadError::MissingAttribute(tag)) if tag == tags::STATUS
		));
	}
}
