//! Assembly of `multipart/related` response bodies.
//!
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_8.6.html#sect_8.6.1.2>

use bytes::Bytes;

const CRLF: &[u8] = b"\r\n";

/// A single body part: its content type and payload, not yet framed by boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedPart {
	pub content_type: String,
	pub payload: Bytes,
}

impl TransformedPart {
	pub fn new(content_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
		Self {
			content_type: content_type.into(),
			payload: payload.into(),
		}
	}

	/// Length of the wrapped part as written by [`TransformedPart::write_to`].
	pub fn wrapped_len(&self) -> usize {
		"Content-Type: ".len()
			+ self.content_type.len()
			+ 2 * CRLF.len()
			+ self.payload.len()
			+ CRLF.len()
	}

	/// Writes the header line, a blank line, the payload and a trailing CRLF.
	pub fn write_to(&self, buffer: &mut Vec<u8>) {
		buffer.extend_from_slice(b"Content-Type: ");
		buffer.extend_from_slice(self.content_type.as_bytes());
		buffer.extend_from_slice(CRLF);
		buffer.extend_from_slice(CRLF);
		buffer.extend_from_slice(&self.payload);
		buffer.extend_from_slice(CRLF);
	}
}

/// Frames every part with `--{boundary}` and appends the closing `--{boundary}--`.
///
/// Parts are emitted in iteration order. The closing delimiter is written even if there are no
/// parts at all.
pub fn assemble<'a>(
	parts: impl IntoIterator<Item = &'a TransformedPart>,
	boundary: &str,
) -> Vec<u8> {
	let parts: Vec<&TransformedPart> = parts.into_iter().collect();
	let mut buffer = Vec::with_capacity(assembled_len(parts.iter().copied(), boundary));
	for part in parts {
		buffer.extend_from_slice(b"--");
		buffer.extend_from_slice(boundary.as_bytes());
		buffer.extend_from_slice(CRLF);
		part.write_to(&mut buffer);
	}
	buffer.extend_from_slice(b"--");
	buffer.extend_from_slice(boundary.as_bytes());
	buffer.extend_from_slice(b"--");
	buffer.extend_from_slice(CRLF);
	buffer
}

/// Exact length of the body [`assemble`] produces for the same parts.
fn assembled_len<'a>(
	parts: impl IntoIterator<Item = &'a TransformedPart>,
	boundary: &str,
) -> usize {
	let delimiter_len = 2 + boundary.len() + CRLF.len();
	let closing_len = delimiter_len + 2;
	parts
		.into_iter()
		.map(|part| delimiter_len + part.wrapped_len())
		.sum::<usize>()
		+ closing_len
}

/// Content type of a `multipart/related` body whose parts are of type `part_type`.
pub fn content_type(part_type: &str, boundary: &str) -> String {
	format!("multipart/related;type='{part_type}';boundary={boundary}")
}
