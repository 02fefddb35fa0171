pub mod storescp;

use crate::backend::dimse::{DicomMessage, DATA_SET_MISSING};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
pub const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;

pub const STATUS_SUCCESS: US = 0x0000;
/// Refused: Out of Resources
pub const STATUS_OUT_OF_RESOURCES: US = 0xA700;
/// Error: Cannot understand
pub const STATUS_CANNOT_UNDERSTAND: US = 0xC000;

/// C-STORE-RSP
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub status: US,
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid)),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}
