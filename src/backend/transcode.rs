use async_trait::async_trait;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::open_file;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom_pixeldata::Transcode;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Rewrites a cached DICOM file in another transfer syntax.
#[async_trait]
pub trait Transcoder: Send + Sync {
	/// Transcodes the file at `path` in place. `directory` is the directory containing `path`
	/// and receives intermediate files. Without a `target` the file is left untouched.
	async fn transcode(
		&self,
		path: &Path,
		directory: &Path,
		target: Option<&str>,
	) -> Result<(), TranscodeError>;
}

#[derive(Debug, Error)]
pub enum TranscodeError {
	#[error("Unknown transfer syntax {0}")]
	UnknownTransferSyntax(String),
	#[error("Failed to read DICOM file: {0}")]
	Read(#[from] dicom::object::ReadError),
	#[error("Failed to write DICOM file: {0}")]
	Write(#[from] dicom::object::WriteError),
	#[error(transparent)]
	Transcode(#[from] dicom_pixeldata::TranscodeError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("Transcoder task failed: {0}")]
	Join(#[from] tokio::task::JoinError),
}

/// [`Transcoder`] backed by the dicom-rs codecs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DicomTranscoder;

impl DicomTranscoder {
	fn transcode_blocking(
		path: &Path,
		directory: &Path,
		target: &str,
	) -> Result<(), TranscodeError> {
		let transfer_syntax = TransferSyntaxRegistry
			.get(target)
			.ok_or_else(|| TranscodeError::UnknownTransferSyntax(target.to_owned()))?;

		let mut file = open_file(path)?;
		let current = file.meta().transfer_syntax().trim_end_matches('\0');
		if current == transfer_syntax.uid() {
			debug!(current, "File already uses the target transfer syntax");
			return Ok(());
		}

		file.transcode(transfer_syntax)?;

		let temp_path = directory.join(format!(".tmp.{}", Uuid::new_v4()));
		if let Err(err) = file.write_to_file(&temp_path) {
			let _ = std::fs::remove_file(&temp_path);
			return Err(err.into());
		}
		std::fs::rename(&temp_path, path)?;
		Ok(())
	}
}

#[async_trait]
impl Transcoder for DicomTranscoder {
	#[instrument(skip_all, fields(path = %path.display()))]
	async fn transcode(
		&self,
		path: &Path,
		directory: &Path,
		target: Option<&str>,
	) -> Result<(), TranscodeError> {
		let Some(target) = target else {
			return Ok(());
		};

		let path: PathBuf = path.to_path_buf();
		let directory: PathBuf = directory.to_path_buf();
		let target = target.to_owned();
		tokio::task::spawn_blocking(move || Self::transcode_blocking(&path, &directory, &target))
			.await?
	}
}
