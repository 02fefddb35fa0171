use super::render::{JpegRenderer, RenderError};
use super::DataFormat;
use crate::backend::Transcoder;
use crate::utils::dataset::{ElementIndex, ParseError};
use crate::utils::multipart::TransformedPart;
use bytes::Bytes;
use dicom::dictionary_std::tags;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, instrument, warn};

#[derive(Debug, Error)]
pub enum TransformError {
	#[error("Failed to read {path}: {source}")]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("Failed to parse {path}: {source}")]
	Parse { path: PathBuf, source: ParseError },
	#[error("{path} has no Pixel Data (7FE0,0010)")]
	MissingPixelData { path: PathBuf },
	#[error(transparent)]
	Render(#[from] RenderError),
}

/// Turns a single cached object into a multipart body part of the requested format.
pub struct ObjectTransformer {
	transcoder: Arc<dyn Transcoder>,
	renderer: Arc<JpegRenderer>,
	/// Media type of full objects, e.g. `application/dicom`.
	mime_type: String,
	/// `transfer-syntax` parameter of full objects.
	transfer_syntax: String,
}

impl ObjectTransformer {
	pub fn new(
		transcoder: Arc<dyn Transcoder>,
		renderer: Arc<JpegRenderer>,
		mime_type: String,
		transfer_syntax: String,
	) -> Self {
		Self {
			transcoder,
			renderer,
			mime_type,
			transfer_syntax,
		}
	}

	/// Returns `None` only for renderings that produced no image.
	#[instrument(skip_all, fields(path = %path.display(), format = ?format))]
	pub async fn to_part(
		&self,
		path: &Path,
		format: DataFormat,
	) -> Result<Option<TransformedPart>, TransformError> {
		let directory = path.parent().unwrap_or_else(|| Path::new("."));
		if let Err(err) = self
			.transcoder
			.transcode(path, directory, format.normalization_target())
			.await
		{
			warn!("Failed to transcode, continuing with the stored encoding: {err}");
		}

		let bytes = match tokio::fs::read(path).await {
			Ok(bytes) => Bytes::from(bytes),
			Err(source) => {
				error!("Failed to read cached object");
				return Err(TransformError::Read {
					path: path.to_path_buf(),
					source,
				});
			}
		};

		let part = match format {
			DataFormat::PixelData | DataFormat::BulkData => {
				let index = ElementIndex::parse(&bytes).map_err(|source| TransformError::Parse {
					path: path.to_path_buf(),
					source,
				})?;
				let pixel_data =
					index
						.value(tags::PIXEL_DATA)
						.ok_or_else(|| TransformError::MissingPixelData {
							path: path.to_path_buf(),
						})?;
				TransformedPart::new(
					mime::APPLICATION_OCTET_STREAM.as_ref(),
					bytes.slice_ref(pixel_data),
				)
			}
			DataFormat::Rendered | DataFormat::Thumbnail => {
				let thumbnail = format == DataFormat::Thumbnail;
				let Some(jpeg) = self.renderer.render(path, thumbnail).await? else {
					return Ok(None);
				};
				TransformedPart::new(mime::IMAGE_JPEG.as_ref(), jpeg)
			}
			DataFormat::Default => TransformedPart::new(
				format!(
					"{}; transfer-syntax={}",
					self.mime_type, self.transfer_syntax
				),
				bytes,
			),
		};

		Ok(Some(part))
	}
}
