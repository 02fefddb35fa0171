use crate::rendering::{frame_path, ConvertError, FrameSelection, ImageConverter};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub const FULL_QUALITY: u8 = 100;
pub const THUMBNAIL_QUALITY: u8 = 10;

#[derive(Debug, Error)]
pub enum RenderError {
	#[error(transparent)]
	Convert(#[from] ConvertError),
	#[error("Failed to read rendered image {path}: {source}")]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},
}

/// Renders cached files to JPEG, retrying once with all frames if the single-frame conversion
/// fails.
pub struct JpegRenderer {
	converter: Arc<dyn ImageConverter>,
}

impl JpegRenderer {
	pub fn new(converter: Arc<dyn ImageConverter>) -> Self {
		Self { converter }
	}

	/// Returns `None` if the conversion succeeded but produced neither `<path>.jpg` nor
	/// `<path>.0.jpg`.
	#[instrument(skip_all, fields(path = %path.display(), thumbnail = thumbnail))]
	pub async fn render(
		&self,
		path: &Path,
		thumbnail: bool,
	) -> Result<Option<Vec<u8>>, RenderError> {
		let quality = if thumbnail {
			THUMBNAIL_QUALITY
		} else {
			FULL_QUALITY
		};
		let output = output_path(path);

		if let Err(err) = self
			.converter
			.convert(path, &output, quality, FrameSelection::Single)
			.await
		{
			warn!("Single frame conversion failed, retrying with all frames: {err}");
			self.converter
				.convert(path, &output, quality, FrameSelection::All)
				.await?;
		}

		for candidate in [output.clone(), frame_path(&output, 0)] {
			match tokio::fs::read(&candidate).await {
				Ok(jpeg) => {
					debug!(output = %candidate.display(), "Rendered image");
					return Ok(Some(jpeg));
				}
				Err(err) if err.kind() == ErrorKind::NotFound => {}
				Err(source) => {
					return Err(RenderError::Read {
						path: candidate,
						source,
					})
				}
			}
		}

		warn!("Converter did not produce an image");
		Ok(None)
	}
}

/// `<path>.jpg`
fn output_path(path: &Path) -> PathBuf {
	let mut output: OsString = path.as_os_str().to_owned();
	output.push(".jpg");
	PathBuf::from(output)
}
