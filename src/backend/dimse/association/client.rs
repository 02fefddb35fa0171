use dicom::ul::pdu::PresentationContextNegotiated;
use dicom::ul::Pdu;
use std::convert::identity;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use super::{AskPattern, Association, AssociationError, ChannelError, Command};

/// Association requested by us (the SCU) towards a remote peer.
pub struct ClientAssociation {
	channel: Sender<Command>,
	uuid: Uuid,
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContextNegotiated>,
}

pub struct ClientAssociationOptions {
	pub calling_aet: String,
	pub called_aet: String,
	pub abstract_syntax: String,
	pub transfer_syntaxes: Vec<String>,
	pub host: String,
	pub port: u16,
}

impl ClientAssociation {
	pub async fn new(options: ClientAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let address: SocketAddr = tokio::net::lookup_host((options.host.as_str(), options.port))
			.await
			.map_err(AssociationError::Resolve)?
			.next()
			.ok_or_else(|| {
				AssociationError::Resolve(std::io::Error::new(
					std::io::ErrorKind::NotFound,
					format!("{} did not resolve to an address", options.host),
				))
			})?;

		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let thread_name = format!("{}-client", options.calling_aet);
		let ul_options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_aet)
			.called_ae_title(options.called_aet)
			.with_presentation_context(options.abstract_syntax, options.transfer_syntaxes);

		let _handle = thread::Builder::new()
			.name(thread_name)
			.spawn(move || {
				let span = tracing::info_span!("ClientAssociation", association_id = uuid.to_string());
				let _enter = span.enter();

				let mut association = match ul_options.establish(address) {
					Ok(mut association) => {
						let presentation_contexts = association.presentation_contexts().to_vec();
						match association.inner_stream().try_clone() {
							Ok(stream) => {
								connect_tx
									.send(Ok((stream, presentation_contexts)))
									.map_err(|_value| ())?;
							}
							Err(err) => {
								connect_tx
									.send(Err(AssociationError::Stream(err)))
									.map_err(|_value| ())?;
								return Err(());
							}
						}
						association
					}
					Err(e) => {
						error!("Failed to connect to {address}: {e}");
						connect_tx.send(Err(e.into())).map_err(|_value| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, reply_to) => {
							let send_result = association
								.send(&pdu)
								.map_err(AssociationError::Association);
							reply_to.send(send_result).map_err(|_value| ChannelError::Closed)
						}
						Command::Receive(reply_to) => {
							let receive_result =
								association.receive().map_err(AssociationError::Association);
							reply_to
								.send(receive_result)
								.map_err(|_value| ChannelError::Closed)
						}
					};
					if let Some(err) = result.err() {
						error!("Error in ClientAssociation: {err}");
						return Err(());
					}
				}

				rx.close();

				if let Err(err) = association.abort() {
					debug!("Failed to abort ClientAssociation: {err}");
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts) = connect_result
			.await
			.map_err(|_value| AssociationError::Channel(ChannelError::Closed))??;

		Ok(Self {
			channel: tx,
			uuid,
			tcp_stream,
			presentation_contexts,
		})
	}
}

impl Drop for ClientAssociation {
	fn drop(&mut self) {
		self.close();
	}
}

impl Association for ClientAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(
				backend_uuid = self.uuid.to_string(),
				"Failed to shutdown TcpStream: {err}"
			);
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}
