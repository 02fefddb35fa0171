use dicom::core::PrimitiveValue;
use std::fmt::{Display, Formatter};

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone, Default)]
pub enum Priority {
	Low = 0x0002,
	#[default]
	Medium = 0x0000,
	High = 0x0001,
}

/// Query/Retrieve Level (0008,0052) used by C-FIND and C-MOVE identifiers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryRetrieveLevel {
	Study,
	Series,
	Image,
}

impl QueryRetrieveLevel {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Study => "STUDY",
			Self::Series => "SERIES",
			Self::Image => "IMAGE",
		}
	}
}

impl Display for QueryRetrieveLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl From<QueryRetrieveLevel> for PrimitiveValue {
	fn from(level: QueryRetrieveLevel) -> Self {
		Self::from(level.as_str())
	}
}

/// Checks that a value is a syntactically valid DICOM UID: 1 to 64 characters,
/// digits and dots only.
pub fn is_valid_uid(value: &str) -> bool {
	!value.is_empty()
		&& value.len() <= 64
		&& value.bytes().all(|b| b.is_ascii_digit() || b == b'.')
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn level_display() {
		assert_eq!(QueryRetrieveLevel::Study.to_string(), "STUDY");
		assert_eq!(QueryRetrieveLevel::Image.to_string(), "IMAGE");
	}

	#[test]
	fn uid_validation() {
		assert!(is_valid_uid("1.2.840.10008.1.2"));
		assert!(!is_valid_uid(""));
		assert!(!is_valid_uid("../etc"));
		assert!(!is_valid_uid("1.2.3;boundary"));
		assert!(!is_valid_uid(&"1".repeat(65)));
	}
}
