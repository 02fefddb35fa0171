//! A lightweight index over the top-level data elements of an encoded DICOM object.
//!
//! Element headers are read with the dicom-rs [`StatefulDecoder`], but no value is decoded:
//! every element is recorded as a span into the original buffer, so values can be handed out as
//! borrowed slices.

use dicom::core::header::DataElementHeader;
use dicom::core::{Tag, VR};
use dicom::dictionary_std::uids;
use dicom::encoding::text::SpecificCharacterSet;
use dicom::encoding::transfer_syntax::TransferSyntax;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::{meta, FileMetaTable};
use dicom::parser::stateful::decode::{self, StatefulDecode, StatefulDecoder};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use std::collections::HashMap;
use std::io::Cursor;
use std::ops::Range;
use thiserror::Error;

const PREAMBLE_LENGTH: usize = 128;
const MAGIC_CODE: &[u8] = b"DICM";
/// Tag, VR and length of the shortest element header.
const MIN_HEADER_LENGTH: usize = 8;
const DELIMITER_LENGTH: usize = 8;
const MAX_DEPTH: usize = 64;

const ITEM: Tag = Tag(0xFFFE, 0xE000);
const ITEM_DELIMITATION: Tag = Tag(0xFFFE, 0xE00D);
const SEQUENCE_DELIMITATION: Tag = Tag(0xFFFE, 0xE0DD);

#[derive(Debug, Error)]
pub enum ParseError {
	#[error("Unexpected end of data at byte {position}")]
	UnexpectedEnd { position: usize },
	#[error("Unexpected tag {tag} at byte {position}")]
	UnexpectedTag { tag: Tag, position: usize },
	#[error("Unsupported transfer syntax {uid}")]
	UnsupportedTransferSyntax { uid: String },
	#[error("Sequences are nested too deeply")]
	TooDeep,
	#[error("Invalid file meta group: {0}")]
	Meta(#[from] meta::Error),
	#[error("Failed to decode element header at byte {position}: {source}")]
	Decode {
		position: usize,
		source: decode::Error,
	},
}

/// Location of an element value within the indexed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementSpan {
	pub offset: usize,
	pub length: usize,
}

impl ElementSpan {
	pub const fn range(self) -> Range<usize> {
		self.offset..self.offset + self.length
	}
}

/// Maps the tags of all top-level data set elements to their value spans.
///
/// Values of undefined length (sequences, encapsulated pixel data) span all of their items,
/// excluding the trailing sequence delimitation item.
#[derive(Debug)]
pub struct ElementIndex<'a> {
	bytes: &'a [u8],
	elements: HashMap<Tag, ElementSpan>,
	transfer_syntax: Option<String>,
}

impl<'a> ElementIndex<'a> {
	pub fn parse(bytes: &'a [u8]) -> Result<Self, ParseError> {
		let mut cursor = Cursor::new(bytes);
		let transfer_syntax =
			if bytes.get(PREAMBLE_LENGTH..PREAMBLE_LENGTH + MAGIC_CODE.len()) == Some(MAGIC_CODE) {
				cursor.set_position(PREAMBLE_LENGTH as u64);
				let meta = FileMetaTable::from_reader(&mut cursor)?;
				Some(meta.transfer_syntax().trim_end_matches('\0').to_owned())
			} else {
				None
			};

		// Data sets without a file meta group use the default transfer syntax
		let ts = lookup(
			transfer_syntax
				.as_deref()
				.unwrap_or(uids::IMPLICIT_VR_LITTLE_ENDIAN),
		)?;
		let mut decoder = decoder_at(bytes, cursor.position() as usize, ts)?;

		let mut elements = HashMap::new();
		while (decoder.position() as usize) < bytes.len() {
			let position = decoder.position() as usize;
			let header = header(&mut decoder, bytes)?;
			if header.tag.0 == 0xFFFE {
				return Err(ParseError::UnexpectedTag {
					tag: header.tag,
					position,
				});
			}
			let span = value(&mut decoder, bytes, &header, 0)?;
			elements.insert(header.tag, span);
		}

		Ok(Self {
			bytes,
			elements,
			transfer_syntax,
		})
	}

	pub fn get(&self, tag: Tag) -> Option<ElementSpan> {
		self.elements.get(&tag).copied()
	}

	/// Returns the value of an element as a view into the indexed buffer.
	pub fn value(&self, tag: Tag) -> Option<&'a [u8]> {
		let bytes = self.bytes;
		self.get(tag).map(|span| &bytes[span.range()])
	}

	/// The transfer syntax declared in the file meta group, if there is one.
	pub fn transfer_syntax(&self) -> Option<&str> {
		self.transfer_syntax.as_deref()
	}

	pub fn len(&self) -> usize {
		self.elements.len()
	}

	pub fn is_empty(&self) -> bool {
		self.elements.is_empty()
	}
}

/// Deflated data sets cannot be indexed because their values are not stored verbatim.
fn lookup(uid: &str) -> Result<&'static TransferSyntax, ParseError> {
	TransferSyntaxRegistry
		.get(uid)
		.filter(|ts| ts.uid() != uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN)
		.ok_or_else(|| ParseError::UnsupportedTransferSyntax {
			uid: uid.to_owned(),
		})
}

fn decoder_at<'a>(
	bytes: &'a [u8],
	position: usize,
	ts: &TransferSyntax,
) -> Result<impl StatefulDecode + 'a, ParseError> {
	let mut cursor = Cursor::new(bytes);
	cursor.set_position(position as u64);
	StatefulDecoder::new_with(cursor, ts, SpecificCharacterSet::default(), position as u64)
		.map_err(|source| ParseError::Decode { position, source })
}

fn header<D: StatefulDecode>(
	decoder: &mut D,
	bytes: &[u8],
) -> Result<DataElementHeader, ParseError> {
	let position = decoder.position() as usize;
	if position + MIN_HEADER_LENGTH > bytes.len() {
		return Err(ParseError::UnexpectedEnd { position });
	}
	decoder
		.decode_header()
		.map_err(|source| ParseError::Decode { position, source })
}

/// Moves the decoder forward to `end` without reading the bytes in between.
fn skip_to<D: StatefulDecode>(
	decoder: &mut D,
	bytes: &[u8],
	end: usize,
) -> Result<(), ParseError> {
	let position = decoder.position() as usize;
	if end > bytes.len() {
		return Err(ParseError::UnexpectedEnd { position });
	}
	let length =
		u32::try_from(end - position).map_err(|_| ParseError::UnexpectedEnd { position })?;
	decoder
		.skip_bytes(length)
		.map_err(|source| ParseError::Decode { position, source })
}

/// Skips the value following `header` and returns its span.
fn value<D: StatefulDecode>(
	decoder: &mut D,
	bytes: &[u8],
	header: &DataElementHeader,
	depth: usize,
) -> Result<ElementSpan, ParseError> {
	let offset = decoder.position() as usize;
	let length = match header.len.get() {
		Some(length) => {
			skip_to(decoder, bytes, offset + length as usize)?;
			length as usize
		}
		None if header.vr == VR::UN => {
			// Undefined length UN values are encoded as implicit VR little endian
			let implicit = lookup(uids::IMPLICIT_VR_LITTLE_ENDIAN)?;
			let mut nested = decoder_at(bytes, offset, implicit)?;
			let end = skip_sequence(&mut nested, bytes, depth + 1)?;
			skip_to(decoder, bytes, end + DELIMITER_LENGTH)?;
			end - offset
		}
		None => skip_sequence(decoder, bytes, depth + 1)? - offset,
	};
	Ok(ElementSpan { offset, length })
}

/// Skips the items of an undefined length value.
/// Returns the position of the sequence delimitation item.
fn skip_sequence<D: StatefulDecode>(
	decoder: &mut D,
	bytes: &[u8],
	depth: usize,
) -> Result<usize, ParseError> {
	if depth > MAX_DEPTH {
		return Err(ParseError::TooDeep);
	}
	loop {
		let position = decoder.position() as usize;
		let header = header(decoder, bytes)?;
		if header.tag == SEQUENCE_DELIMITATION {
			return Ok(position);
		} else if header.tag != ITEM {
			return Err(ParseError::UnexpectedTag {
				tag: header.tag,
				position,
			});
		}
		match header.len.get() {
			Some(length) => {
				let end = decoder.position() as usize + length as usize;
				skip_to(decoder, bytes, end)?;
			}
			None => skip_item(decoder, bytes, depth)?,
		}
	}
}

fn skip_item<D: StatefulDecode>(
	decoder: &mut D,
	bytes: &[u8],
	depth: usize,
) -> Result<(), ParseError> {
	loop {
		let position = decoder.position() as usize;
		let header = header(decoder, bytes)?;
		if header.tag == ITEM_DELIMITATION {
			return Ok(());
		} else if header.tag.0 == 0xFFFE {
			return Err(ParseError::UnexpectedTag {
				tag: header.tag,
				position,
			});
		}
		value(decoder, bytes, &header, depth)?;
	}
}
