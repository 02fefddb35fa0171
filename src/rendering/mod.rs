//! Conversion of cached DICOM files into JPEG images.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;

mod pixeldata;
mod process;

pub use pixeldata::PixelDataConverter;
pub use process::ProcessConverter;

/// Which frames of a (possibly multi-frame) object are converted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameSelection {
	/// Only the first frame, written to the output path itself.
	Single,
	/// Every frame, written to `<output-stem>.<n>.jpg`.
	All,
}

/// Writes JPEG renderings of a DICOM file next to it.
#[async_trait]
pub trait ImageConverter: Send + Sync {
	async fn convert(
		&self,
		input: &Path,
		output: &Path,
		quality: u8,
		frames: FrameSelection,
	) -> Result<(), ConvertError>;
}

#[derive(Debug, Error)]
pub enum ConvertError {
	#[error("Failed to run {program}: {source}")]
	Spawn {
		program: String,
		source: std::io::Error,
	},
	#[error("{program} exited with {status}: {stderr}")]
	ExitStatus {
		program: String,
		status: std::process::ExitStatus,
		stderr: String,
	},
	#[error("Object has {0} frames, but a single frame was requested")]
	MultiFrame(u32),
	#[error("Failed to read DICOM file: {0}")]
	Read(#[from] dicom::object::ReadError),
	#[error(transparent)]
	PixelData(#[from] dicom_pixeldata::Error),
	#[error(transparent)]
	Image(#[from] image::ImageError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("Converter task failed: {0}")]
	Join(#[from] tokio::task::JoinError),
}

/// Output path of frame `index` when all frames are converted: `<stem>.<index>.jpg` where
/// `<stem>` is `output` without its extension.
pub fn frame_path(output: &Path, index: u32) -> PathBuf {
	let mut path: OsString = output.with_extension("").into_os_string();
	path.push(format!(".{index}.jpg"));
	PathBuf::from(path)
}
