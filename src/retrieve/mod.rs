//! The WADO-RS retrieve pipeline.
//!
//! A request is answered from the local cache. If the cache does not hold every instance of the
//! requested scope, the whole scope is fetched from the remote source first. Objects are then
//! transformed into the requested format and assembled into a `multipart/related` body, except
//! for thumbnails which are returned as a bare JPEG.

mod cache;
mod fetch;
mod render;
mod transform;

#[cfg(test)]
mod fakes;

pub use cache::{CacheChecker, CacheStatus};
pub use fetch::FetchTrigger;
pub use render::{JpegRenderer, RenderError};
pub use transform::{ObjectTransformer, TransformError};

use crate::backend::{FetchError, FetchOrchestrator, MetadataQuery, QueryError, Transcoder};
use crate::config::StorageConfig;
use crate::rendering::ImageConverter;
use crate::types::{QueryRetrieveLevel, UI};
use crate::utils::multipart;
use bytes::Bytes;
use futures::future::try_join_all;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

/// Transfer syntax that every non-default format is normalized to before extraction.
pub const NORMALIZED_TRANSFER_SYNTAX: &str = "1.2.840.10008.1.2";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalScope {
	pub study_instance_uid: UI,
	pub series_instance_uid: Option<UI>,
	/// Narrows the scope to a single object.
	pub sop_instance_uid: Option<UI>,
}

impl RetrievalScope {
	/// The level at which the scope is fetched. Any scope below the study is fetched per image.
	pub const fn query_level(&self) -> QueryRetrieveLevel {
		if self.series_instance_uid.is_some() {
			QueryRetrieveLevel::Image
		} else {
			QueryRetrieveLevel::Study
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFormat {
	/// The full object.
	#[default]
	Default,
	PixelData,
	BulkData,
	Rendered,
	Thumbnail,
}

impl DataFormat {
	pub const fn normalization_target(self) -> Option<&'static str> {
		match self {
			Self::Default => None,
			_ => Some(NORMALIZED_TRANSFER_SYNTAX),
		}
	}

	/// The `type` parameter of the multipart response.
	pub const fn part_type(self) -> &'static str {
		match self {
			Self::Default => "application/dicom",
			Self::PixelData | Self::BulkData => "application/octet-stream",
			Self::Rendered | Self::Thumbnail => "image/jpeg",
		}
	}
}

#[derive(Debug, Clone)]
pub struct RetrieveRequest {
	pub scope: RetrievalScope,
	pub format: DataFormat,
}

#[derive(Debug, Clone)]
pub struct RetrieveResponse {
	pub content_type: String,
	pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum RetrieveError {
	#[error(transparent)]
	Query(#[from] QueryError),
	#[error(transparent)]
	Fetch(#[from] FetchError),
	#[error(transparent)]
	Transform(#[from] TransformError),
	#[error(transparent)]
	Render(#[from] RenderError),
	#[error("thumbnail creation failed")]
	ThumbnailFailed,
	#[error("Failed to list {path}: {source}")]
	Enumerate {
		path: PathBuf,
		source: std::io::Error,
	},
}

pub struct Retriever {
	storage: PathBuf,
	cache: CacheChecker,
	fetch: FetchTrigger,
	renderer: Arc<JpegRenderer>,
	transformer: ObjectTransformer,
}

impl Retriever {
	pub fn new(
		storage: &StorageConfig,
		query: Arc<dyn MetadataQuery>,
		orchestrator: Arc<dyn FetchOrchestrator>,
		transcoder: Arc<dyn Transcoder>,
		converter: Arc<dyn ImageConverter>,
	) -> Self {
		let renderer = Arc::new(JpegRenderer::new(converter));
		Self {
			storage: storage.path.clone(),
			cache: CacheChecker::new(storage.path.clone(), query),
			fetch: FetchTrigger::new(orchestrator),
			transformer: ObjectTransformer::new(
				transcoder,
				Arc::clone(&renderer),
				storage.mime_type.clone(),
				storage.transfer_syntax.clone(),
			),
			renderer,
		}
	}

	#[instrument(skip_all, fields(
		study_instance_uid = %request.scope.study_instance_uid,
		format = ?request.format
	))]
	pub async fn retrieve(
		&self,
		request: &RetrieveRequest,
	) -> Result<RetrieveResponse, RetrieveError> {
		let status = self.cache.check(&request.scope).await?;
		if status.hit {
			debug!("Cache hit");
		} else {
			self.fetch.ensure_fetched(&request.scope).await?;
		}

		let files = if status.is_directory_scope {
			self.enumerate(&request.scope.study_instance_uid, &status.expected_instances)
				.await?
		} else {
			vec![status.target_path]
		};

		if request.format == DataFormat::Thumbnail {
			let file = files.first().ok_or(RetrieveError::ThumbnailFailed)?;
			let jpeg = self
				.renderer
				.render(file, true)
				.await?
				.ok_or(RetrieveError::ThumbnailFailed)?;
			return Ok(RetrieveResponse {
				content_type: mime::IMAGE_JPEG.to_string(),
				body: Bytes::from(jpeg),
			});
		}

		let parts = try_join_all(
			files
				.iter()
				.map(|file| self.transformer.to_part(file, request.format)),
		)
		.await?;
		let parts: Vec<_> = parts.into_iter().flatten().collect();
		debug!(parts = parts.len(), "Assembling multipart response");

		let boundary = &request.scope.study_instance_uid;
		Ok(RetrieveResponse {
			content_type: multipart::content_type(request.format.part_type(), boundary),
			body: Bytes::from(multipart::assemble(&parts, boundary)),
		})
	}

	/// Lists the cached files of a study that belong to the expected instances, sorted by name.
	async fn enumerate(
		&self,
		study_instance_uid: &str,
		expected_instances: &[UI],
	) -> Result<Vec<PathBuf>, RetrieveError> {
		let directory = self.storage.join(study_instance_uid);
		let expected: HashSet<&str> = expected_instances.iter().map(String::as_str).collect();

		let mut entries = match tokio::fs::read_dir(&directory).await {
			Ok(entries) => entries,
			Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
			Err(source) => return Err(enumerate_error(&directory, source)),
		};

		let mut names = Vec::new();
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|source| enumerate_error(&directory, source))?
		{
			if let Some(name) = entry.file_name().to_str() {
				if expected.contains(name) {
					names.push(name.to_owned());
				}
			}
		}
		names.sort_unstable();

		Ok(names.into_iter().map(|name| directory.join(name)).collect())
	}
}

fn enumerate_error(path: &Path, source: std::io::Error) -> RetrieveError {
	RetrieveError::Enumerate {
		path: path.to_path_buf(),
		source,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::FetchRequest;
	use super::fakes::{FakeConverter, FakeQuery, FakeTranscoder, Output, RecordingFetch};
	use crate::backend::DicomTranscoder;
	use crate::config::AppConfig;
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::dictionary_std::tags;
	use dicom::object::{open_file, FileMetaTableBuilder, InMemDicomObject};
	use std::time::Duration;

	struct Fixture {
		storage: tempfile::TempDir,
		query: Arc<FakeQuery>,
		orchestrator: Arc<RecordingFetch>,
		transcoder: Arc<FakeTranscoder>,
		output: Output,
	}

	impl Fixture {
		fn new<const N: usize>(instances: [&str; N]) -> Self {
			Self {
				storage: tempfile::tempdir().unwrap(),
				query: Arc::new(FakeQuery::new(instances)),
				orchestrator: Arc::new(RecordingFetch::default()),
				transcoder: Arc::new(FakeTranscoder::default()),
				output: Output::Plain,
			}
		}

		fn write(&self, study: &str, instance: &str, content: &[u8]) {
			let directory = self.storage.path().join(study);
			std::fs::create_dir_all(&directory).unwrap();
			std::fs::write(directory.join(instance), content).unwrap();
		}

		fn retriever(&self) -> Retriever {
			let storage = StorageConfig {
				path: self.storage.path().to_path_buf(),
				mime_type: String::from("application/dicom"),
				transfer_syntax: String::from("1.2.840.10008.1.2"),
			};
			Retriever::new(
				&storage,
				self.query.clone(),
				self.orchestrator.clone(),
				self.transcoder.clone(),
				Arc::new(FakeConverter::new(self.output)),
			)
		}
	}

	fn request(study: &str, instance: Option<&str>, format: DataFormat) -> RetrieveRequest {
		RetrieveRequest {
			scope: RetrievalScope {
				study_instance_uid: UI::from(study),
				series_instance_uid: None,
				sop_instance_uid: instance.map(UI::from),
			},
			format,
		}
	}

	#[test]
	fn series_scopes_are_image_level() {
		let mut scope = RetrievalScope {
			study_instance_uid: UI::from("1.2"),
			series_instance_uid: None,
			sop_instance_uid: None,
		};
		assert_eq!(scope.query_level(), QueryRetrieveLevel::Study);

		scope.series_instance_uid = Some(UI::from("1.2.3"));
		assert_eq!(scope.query_level(), QueryRetrieveLevel::Image);

		scope.sop_instance_uid = Some(UI::from("1.2.3.4"));
		assert_eq!(scope.query_level(), QueryRetrieveLevel::Image);
	}

	#[tokio::test]
	async fn cached_instance_is_served_without_fetch() {
		let fixture = Fixture::new(["1.1"]);
		fixture.write("1", "1.1", b"object");

		let response = fixture
			.retriever()
			.retrieve(&request("1", Some("1.1"), DataFormat::Default))
			.await
			.unwrap();

		assert!(fixture.orchestrator.requests.lock().unwrap().is_empty());
		assert_eq!(
			response.content_type,
			"multipart/related;type='application/dicom';boundary=1"
		);
		assert_eq!(
			response.body,
			&b"--1\r\n\
			Content-Type: application/dicom; transfer-syntax=1.2.840.10008.1.2.1\r\n\r\n\
			object\r\n\
			--1--\r\n"[..]
		);
	}

	#[tokio::test]
	async fn missing_instance_fetches_whole_study() {
		let mut fixture = Fixture::new(["2.1", "2.2"]);
		fixture.write("2", "2.1", b"first");
		let second = fixture.storage.path().join("2/2.2");
		Arc::get_mut(&mut fixture.orchestrator).unwrap().populate =
			vec![(second, b"second".to_vec())];

		let response = fixture
			.retriever()
			.retrieve(&request("2", None, DataFormat::Default))
			.await
			.unwrap();

		assert_eq!(
			*fixture.orchestrator.requests.lock().unwrap(),
			[FetchRequest {
				study_instance_uid: UI::from("2"),
				series_instance_uid: UI::new(),
				sop_instance_uid: UI::new(),
				level: QueryRetrieveLevel::Study,
			}]
		);
		let body = String::from_utf8(response.body.to_vec()).unwrap();
		assert_eq!(body.matches("--2\r\n").count(), 2);
		assert!(body.find("first").unwrap() < body.find("second").unwrap());
	}

	#[tokio::test]
	async fn absent_thumbnail_fails() {
		let mut fixture = Fixture::new(["3.1"]);
		fixture.write("3", "3.1", b"object");
		fixture.output = Output::Nothing;

		let result = fixture
			.retriever()
			.retrieve(&request("3", Some("3.1"), DataFormat::Thumbnail))
			.await;

		match result {
			Err(err @ RetrieveError::ThumbnailFailed) => {
				assert_eq!(err.to_string(), "thumbnail creation failed");
			}
			other => panic!("unexpected result {other:?}"),
		}
	}

	#[tokio::test]
	async fn thumbnail_is_a_bare_jpeg() {
		let fixture = Fixture::new(["3.1", "3.2"]);
		fixture.write("3", "3.2", b"second");
		fixture.write("3", "3.1", b"first");

		let response = fixture
			.retriever()
			.retrieve(&request("3", None, DataFormat::Thumbnail))
			.await
			.unwrap();

		assert_eq!(response.content_type, "image/jpeg");
		assert_eq!(response.body, [0xFF, 0xD8, 0xFF, 0xD9][..]);
		assert!(fixture.storage.path().join("3/3.1.jpg").exists());
		assert!(!fixture.storage.path().join("3/3.2.jpg").exists());
	}

	#[tokio::test]
	async fn parts_keep_enumeration_order() {
		let mut fixture = Fixture::new(["4.1", "4.2", "4.3"]);
		fixture.write("4", "4.1", b"a");
		fixture.write("4", "4.2", b"b");
		fixture.write("4", "4.3", b"c");
		let transcoder = Arc::get_mut(&mut fixture.transcoder).unwrap();
		transcoder.delays.insert(String::from("4.1"), Duration::from_millis(60));
		transcoder.delays.insert(String::from("4.2"), Duration::from_millis(120));

		let response = fixture
			.retriever()
			.retrieve(&request("4", None, DataFormat::Default))
			.await
			.unwrap();

		let finished: Vec<_> = fixture
			.transcoder
			.calls
			.lock()
			.unwrap()
			.iter()
			.map(|(path, _)| path.file_name().unwrap().to_string_lossy().into_owned())
			.collect();
		assert_eq!(finished, ["4.3", "4.1", "4.2"]);

		let body = String::from_utf8(response.body.to_vec()).unwrap();
		let payloads: Vec<_> = body
			.split("--4")
			.filter_map(|part| part.split("\r\n\r\n").nth(1))
			.map(|rest| rest.trim_end_matches("\r\n"))
			.collect();
		assert_eq!(payloads, ["a", "b", "c"]);
	}

	#[tokio::test]
	async fn unexpected_files_are_skipped() {
		let fixture = Fixture::new(["5.1"]);
		fixture.write("5", "5.1", b"expected");
		fixture.write("5", "5.9", b"stray");
		fixture.write("5", "5.1.jpg", b"rendering");

		let response = fixture
			.retriever()
			.retrieve(&request("5", None, DataFormat::Default))
			.await
			.unwrap();

		let body = String::from_utf8(response.body.to_vec()).unwrap();
		assert!(body.contains("expected"));
		assert!(!body.contains("stray"));
		assert!(!body.contains("rendering"));
	}

	#[tokio::test]
	async fn empty_study_closes_the_body() {
		let fixture = Fixture::new([]);

		let response = fixture
			.retriever()
			.retrieve(&request("6", None, DataFormat::PixelData))
			.await
			.unwrap();

		assert!(fixture.orchestrator.requests.lock().unwrap().is_empty());
		assert_eq!(
			response.content_type,
			"multipart/related;type='application/octet-stream';boundary=6"
		);
		assert_eq!(response.body, &b"--6--\r\n"[..]);
	}

	#[tokio::test]
	async fn fetch_failures_abort_the_request() {
		let mut fixture = Fixture::new(["7.1"]);
		Arc::get_mut(&mut fixture.orchestrator).unwrap().fail = true;

		let result = fixture
			.retriever()
			.retrieve(&request("7", None, DataFormat::Default))
			.await;

		assert!(matches!(result, Err(RetrieveError::Fetch(_))));
	}

	#[tokio::test]
	async fn absent_renderings_are_left_out() {
		let mut fixture = Fixture::new(["8.1"]);
		fixture.write("8", "8.1", b"object");
		fixture.output = Output::Nothing;

		let response = fixture
			.retriever()
			.retrieve(&request("8", None, DataFormat::Rendered))
			.await
			.unwrap();

		assert_eq!(
			response.content_type,
			"multipart/related;type='image/jpeg';boundary=8"
		);
		assert_eq!(response.body, &b"--8--\r\n"[..]);
	}

	const PIXELS: [u8; 16] = [0, 16, 32, 48, 64, 80, 96, 112, 128, 144, 160, 176, 192, 208, 224, 240];

	/// Writes an explicit VR little endian 4x4 MONOCHROME2 image.
	fn write_image(path: &Path) {
		let object = InMemDicomObject::from_element_iter([
			DataElement::new(
				tags::SOP_CLASS_UID,
				VR::UI,
				PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.7"),
			),
			DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("9.1")),
			DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
			DataElement::new(
				tags::PHOTOMETRIC_INTERPRETATION,
				VR::CS,
				PrimitiveValue::from("MONOCHROME2"),
			),
			DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(4_u16)),
			DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(4_u16)),
			DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(8_u16)),
			DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(8_u16)),
			DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(7_u16)),
			DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
			DataElement::new(tags::PIXEL_DATA, VR::OB, PrimitiveValue::from(PIXELS.to_vec())),
		]);
		let file = object.with_exact_meta(
			FileMetaTableBuilder::new()
				.media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
				.media_storage_sop_instance_uid("9.1")
				.transfer_syntax("1.2.840.10008.1.2.1")
				.build()
				.unwrap(),
		);
		file.write_to_file(path).unwrap();
	}

	#[tokio::test]
	async fn default_parts_follow_a_normalized_object() {
		let fixture = Fixture::new(["9.1"]);
		let path = fixture.storage.path().join("9").join("9.1");
		std::fs::create_dir_all(path.parent().unwrap()).unwrap();
		write_image(&path);

		let mut storage = AppConfig::new().unwrap().storage;
		storage.path = fixture.storage.path().to_path_buf();
		let retriever = Retriever::new(
			&storage,
			fixture.query.clone(),
			fixture.orchestrator.clone(),
			Arc::new(DicomTranscoder),
			Arc::new(FakeConverter::new(Output::Plain)),
		);

		let pixel_data = retriever
			.retrieve(&request("9", Some("9.1"), DataFormat::PixelData))
			.await
			.unwrap();
		assert!(pixel_data.body.windows(PIXELS.len()).any(|window| window == PIXELS));

		let response = retriever
			.retrieve(&request("9", Some("9.1"), DataFormat::Default))
			.await
			.unwrap();

		let file = open_file(&path).unwrap();
		let stored = file.meta().transfer_syntax().trim_end_matches('\0');
		assert_eq!(stored, NORMALIZED_TRANSFER_SYNTAX);
		let body = String::from_utf8_lossy(&response.body);
		assert!(body.contains(&format!(
			"Content-Type: application/dicom; transfer-syntax={stored}\r\n"
		)));
	}
}
