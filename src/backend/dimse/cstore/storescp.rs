use crate::backend::dimse::association;
use crate::backend::dimse::cstore::{
	CompositeStoreResponse, COMMAND_FIELD_COMPOSITE_STORE_REQUEST, STATUS_CANNOT_UNDERSTAND,
	STATUS_OUT_OF_RESOURCES, STATUS_SUCCESS,
};
use crate::backend::dimse::{DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError};
use crate::config::{DimseServerConfig, StorageConfig};
use crate::types::{is_valid_uid, UI, US};
use anyhow::Context;
use association::server::{ServerAssociation, ServerAssociationOptions};
use association::Association;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom::ul::Pdu;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives the C-STORE sub-operations of our C-MOVE requests and writes every instance to
/// `<storage>/<StudyInstanceUID>/<SOPInstanceUID>` before acknowledging it.
pub struct StoreServiceClassProvider {
	inner: Arc<InnerStoreServiceClassProvider>,
}

struct InnerStoreServiceClassProvider {
	config: DimseServerConfig,
	storage: StorageConfig,
}

impl StoreServiceClassProvider {
	pub fn new(config: DimseServerConfig, storage: StorageConfig) -> Self {
		Self {
			inner: Arc::new(InnerStoreServiceClassProvider { config, storage }),
		}
	}

	pub async fn spawn(&self) -> anyhow::Result<()> {
		let address = SocketAddr::from((self.inner.config.interface, self.inner.config.port));
		let listener = TcpListener::bind(&address).await?;
		info!("Started Store Service Class Provider on {}", address);
		loop {
			match listener.accept().await {
				Ok((stream, peer)) => {
					let span = info_span!(
						"STORE-SCP",
						aet = &self.inner.config.aet,
						peer = peer.to_string()
					);
					info!("Accepted incoming connection from {peer}");
					let inner = Arc::clone(&self.inner);
					tokio::spawn(async move {
						if let Err(err) = Self::process(stream, inner).instrument(span).await {
							error!("{err:#}");
						}
					});
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			};
		}
	}

	#[instrument(skip_all)]
	async fn process(
		stream: TcpStream,
		inner: Arc<InnerStoreServiceClassProvider>,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// dicom-rs performs blocking reads/writes on the ServerAssociation thread.
		tcp_stream.set_nonblocking(false)?;

		let options = ServerAssociationOptions {
			aet: inner.config.aet.clone(),
			transfer_syntax: inner.storage.transfer_syntax.clone(),
			tcp_stream,
		};
		let association = ServerAssociation::new(options).await?;

		loop {
			let message = match association.read_message(Duration::MAX).await {
				Ok(message) => message,
				Err(ReadError::UnexpectedPdu(Pdu::ReleaseRQ)) => {
					debug!("Peer requested release");
					association.send(Pdu::ReleaseRP, RESPONSE_TIMEOUT).await?;
					return Ok(());
				}
				Err(ReadError::UnexpectedPdu(Pdu::AbortRQ { .. })) => {
					warn!("Peer aborted the association");
					return Ok(());
				}
				Err(err) => return Err(err.into()),
			};

			let presentation_context_id = message.presentation_context_id;
			let response = Self::handle(&association, message, &inner.storage.path).await?;
			association
				.write_message(response, presentation_context_id, RESPONSE_TIMEOUT)
				.await?;
		}
	}

	/// Stores the instance of a C-STORE-RQ and builds the matching response.
	async fn handle(
		association: &ServerAssociation,
		message: DicomMessage,
		storage: &Path,
	) -> anyhow::Result<CompositeStoreResponse> {
		let command_field = message
			.command
			.get(tags::COMMAND_FIELD)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.context("Missing tag COMMAND_FIELD (0000,0100)")?;

		if command_field != COMMAND_FIELD_COMPOSITE_STORE_REQUEST {
			anyhow::bail!(
				"Unexpected Command Field {command_field:#06x}. Only C-STORE-RQ is supported."
			);
		}

		let message_id = message
			.command
			.get(tags::MESSAGE_ID)
			.map(InMemElement::to_int)
			.and_then(Result::ok)
			.unwrap_or(0);

		let sop_class_uid = command_uid(&message.command, tags::AFFECTED_SOP_CLASS_UID)
			.context("Missing tag AFFECTED_SOP_CLASS_UID (0000,0002)")?;
		let sop_instance_uid = command_uid(&message.command, tags::AFFECTED_SOP_INSTANCE_UID)
			.context("Missing tag AFFECTED_SOP_INSTANCE_UID (0000,1000)")?;

		let transfer_syntax = association
			.presentation_contexts()
			.iter()
			.find(|pctx| Some(pctx.id) == message.presentation_context_id)
			.map(|pctx| pctx.transfer_syntax.clone())
			.context("No presentation context available")?;
		debug!("Used transfer syntax {transfer_syntax} to read message");

		let mut response = CompositeStoreResponse {
			message_id,
			sop_class_uid: sop_class_uid.clone(),
			sop_instance_uid: sop_instance_uid.clone(),
			status: STATUS_SUCCESS,
		};

		let Some(data) = message.data else {
			warn!(%sop_instance_uid, "C-STORE-RQ without data set");
			response.status = STATUS_CANNOT_UNDERSTAND;
			return Ok(response);
		};

		let storage = storage.to_path_buf();
		let instance = StoredInstance {
			sop_class_uid,
			sop_instance_uid,
			transfer_syntax,
		};
		let result =
			tokio::task::spawn_blocking(move || store_instance(&storage, &instance, data)).await?;

		match result {
			Ok(path) => info!(path = %path.display(), "Stored instance"),
			Err(StoreError::InvalidIdentifier(err)) => {
				warn!("Rejected instance: {err:#}");
				response.status = STATUS_CANNOT_UNDERSTAND;
			}
			Err(StoreError::Io(err)) => {
				error!("Failed to store instance: {err:#}");
				response.status = STATUS_OUT_OF_RESOURCES;
			}
		}
		Ok(response)
	}
}

fn command_uid(command: &InMemDicomObject, tag: dicom::core::Tag) -> Option<UI> {
	command
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| UI::from(value.trim_end_matches(['\0', ' '])))
}

struct StoredInstance {
	sop_class_uid: UI,
	sop_instance_uid: UI,
	transfer_syntax: UI,
}

#[derive(Debug)]
enum StoreError {
	InvalidIdentifier(anyhow::Error),
	Io(anyhow::Error),
}

/// Writes the data set to `<storage>/<study>/<instance>` through a temporary file, so readers
/// never observe a partially written instance.
fn store_instance(
	storage: &Path,
	instance: &StoredInstance,
	data: InMemDicomObject,
) -> Result<PathBuf, StoreError> {
	let study_instance_uid = data
		.get(tags::STUDY_INSTANCE_UID)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| UI::from(value.trim_end_matches(['\0', ' '])))
		.context("Missing tag STUDY_INSTANCE_UID (0020,000D)")
		.map_err(StoreError::InvalidIdentifier)?;

	for uid in [&study_instance_uid, &instance.sop_instance_uid] {
		if !is_valid_uid(uid) {
			return Err(StoreError::InvalidIdentifier(anyhow::anyhow!(
				"'{uid}' is not a valid UID"
			)));
		}
	}

	let meta = FileMetaTableBuilder::new()
		.media_storage_sop_class_uid(instance.sop_class_uid.as_str())
		.media_storage_sop_instance_uid(instance.sop_instance_uid.as_str())
		.transfer_syntax(instance.transfer_syntax.as_str())
		.implementation_class_uid(crate::IMPLEMENTATION_CLASS_UID)
		.implementation_version_name(crate::IMPLEMENTATION_VERSION_NAME)
		.build()
		.context("Failed to build file meta group")
		.map_err(StoreError::InvalidIdentifier)?;
	let file = data.with_exact_meta(meta);

	let directory = storage.join(&study_instance_uid);
	let write = || -> anyhow::Result<PathBuf> {
		std::fs::create_dir_all(&directory)
			.with_context(|| format!("Failed to create {}", directory.display()))?;
		let path = directory.join(&instance.sop_instance_uid);
		let temp_path = directory.join(format!(".tmp.{}", Uuid::new_v4()));
		if let Err(err) = file.write_to_file(&temp_path) {
			let _ = std::fs::remove_file(&temp_path);
			return Err(err).context("Failed to write DICOM file");
		}
		std::fs::rename(&temp_path, &path)
			.with_context(|| format!("Failed to move instance to {}", path.display()))?;
		Ok(path)
	};
	write().map_err(StoreError::Io)
}
