use crate::backend::dimse::association::client::{ClientAssociation, ClientAssociationOptions};
use crate::backend::dimse::association::AssociationError;
use crate::backend::dimse::cmove::{move_identifier, CompositeMoveRequest};
use crate::backend::dimse::{
	next_message_id, DicomMessageReader, DicomMessageWriter, ReadError, StatusType, WriteError,
};
use crate::backend::{FetchError, FetchOrchestrator, FetchRequest};
use crate::config::PacsConfig;
use crate::types::{AE, UI, US};
use async_trait::async_trait;
use dicom::dictionary_std::uids;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, trace};

/// Fetches instances into the cache by asking the PACS to C-MOVE them to our STORE-SCP.
pub struct MoveServiceClassUser {
	calling_aet: AE,
	destination: AE,
	pacs: PacsConfig,
}

impl MoveServiceClassUser {
	pub const fn new(calling_aet: AE, destination: AE, pacs: PacsConfig) -> Self {
		Self {
			calling_aet,
			destination,
			pacs,
		}
	}

	const fn timeout(&self) -> Duration {
		Duration::from_millis(self.pacs.move_timeout)
	}

	async fn invoke(&self, request: CompositeMoveRequest) -> Result<(), MoveError> {
		let association = ClientAssociation::new(ClientAssociationOptions {
			calling_aet: self.calling_aet.clone(),
			called_aet: self.pacs.aet.clone(),
			abstract_syntax: UI::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE),
			transfer_syntaxes: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
			host: self.pacs.host.clone(),
			port: self.pacs.port,
		})
		.await?;

		association
			.write_message(request, None, self.timeout())
			.await?;
		trace!("Sent C-MOVE-RQ");

		loop {
			let response = association.read_message(self.timeout()).await?;
			trace!("Received C-MOVE-RSP");

			let status = response.status().unwrap_or(0xFFFF);
			match StatusType::try_from(status).unwrap_or(StatusType::Failure) {
				StatusType::Success => {
					info!("C-MOVE completed successfully");
					return Ok(());
				}
				StatusType::Pending => {
					trace!("C-MOVE is pending");
				}
				StatusType::Cancel => return Err(MoveError::Cancelled),
				StatusType::Failure | StatusType::Warning => {
					error!("C-MOVE sub-operation failed with status {status:#06x}");
					return Err(MoveError::OperationFailed(status));
				}
			}
		}
	}
}

#[async_trait]
impl FetchOrchestrator for MoveServiceClassUser {
	#[instrument(
		skip_all,
		name = "MOVE-SCU",
		fields(study_instance_uid = %request.study_instance_uid, level = %request.level)
	)]
	async fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError> {
		let move_request = CompositeMoveRequest::new(next_message_id(), self.destination.clone())
			.identifier(move_identifier(request));

		tokio::time::timeout(self.timeout(), self.invoke(move_request))
			.await
			.map_err(|_elapsed| FetchError::Timeout)?
			.map_err(FetchError::from)
	}
}

#[derive(Debug, Error)]
pub enum MoveError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error("Sub-operation failed with status {0:#06x}")]
	OperationFailed(US),
	#[error("C-MOVE operation was canceled")]
	Cancelled,
}

impl From<MoveError> for FetchError {
	fn from(err: MoveError) -> Self {
		match err {
			MoveError::Cancelled => Self::Cancelled,
			MoveError::OperationFailed(status) => Self::Failed { status },
			err => Self::Backend { source: err.into() },
		}
	}
}
