//! Collaborators for tests of the retrieve pipeline.

use crate::backend::{
	FetchError, FetchOrchestrator, FetchRequest, MetadataQuery, QueryError, QueryFilters,
	TranscodeError, Transcoder,
};
use crate::rendering::{frame_path, ConvertError, FrameSelection, ImageConverter};
use crate::types::QueryRetrieveLevel;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Reports a fixed list of instances, one partial result per instance.
pub struct FakeQuery {
	instances: Vec<String>,
	filters: Mutex<Vec<(QueryRetrieveLevel, QueryFilters)>>,
}

impl FakeQuery {
	pub fn new<const N: usize>(instances: [&str; N]) -> Self {
		Self {
			instances: instances.iter().map(ToString::to_string).collect(),
			filters: Mutex::default(),
		}
	}

	pub fn filters(&self) -> Vec<(QueryRetrieveLevel, QueryFilters)> {
		self.filters.lock().unwrap().clone()
	}
}

#[async_trait]
impl MetadataQuery for FakeQuery {
	async fn find(
		&self,
		level: QueryRetrieveLevel,
		filters: &QueryFilters,
	) -> Result<Vec<Value>, QueryError> {
		self.filters.lock().unwrap().push((level, filters.clone()));
		Ok(self
			.instances
			.iter()
			.map(|uid| json!([{ "00080018": { "vr": "UI", "Value": [uid] } }]))
			.collect())
	}
}

pub struct FailingQuery;

#[async_trait]
impl MetadataQuery for FailingQuery {
	async fn find(
		&self,
		_level: QueryRetrieveLevel,
		_filters: &QueryFilters,
	) -> Result<Vec<Value>, QueryError> {
		Err(QueryError::Timeout)
	}
}

/// Records fetch requests and optionally writes files into the cache, like a STORE-SCP would.
#[derive(Default)]
pub struct RecordingFetch {
	pub requests: Mutex<Vec<FetchRequest>>,
	pub populate: Vec<(PathBuf, Vec<u8>)>,
	pub fail: bool,
}

#[async_trait]
impl FetchOrchestrator for RecordingFetch {
	async fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError> {
		self.requests.lock().unwrap().push(request.clone());
		if self.fail {
			return Err(FetchError::Failed { status: 0xA701 });
		}
		for (path, content) in &self.populate {
			if let Some(parent) = path.parent() {
				std::fs::create_dir_all(parent).unwrap();
			}
			std::fs::write(path, content).unwrap();
		}
		Ok(())
	}
}

/// Records calls and optionally delays or fails them.
#[derive(Default)]
pub struct FakeTranscoder {
	pub calls: Mutex<Vec<(PathBuf, Option<String>)>>,
	/// Delay per file name.
	pub delays: HashMap<String, Duration>,
	pub fail: bool,
}

#[async_trait]
impl Transcoder for FakeTranscoder {
	async fn transcode(
		&self,
		path: &Path,
		_directory: &Path,
		target: Option<&str>,
	) -> Result<(), TranscodeError> {
		let name = path
			.file_name()
			.map(|name| name.to_string_lossy().into_owned())
			.unwrap_or_default();
		if let Some(delay) = self.delays.get(&name) {
			tokio::time::sleep(*delay).await;
		}
		self.calls
			.lock()
			.unwrap()
			.push((path.to_path_buf(), target.map(ToOwned::to_owned)));
		if self.fail {
			return Err(TranscodeError::UnknownTransferSyntax(String::from("1.2.3")));
		}
		Ok(())
	}
}

/// Where a [`FakeConverter`] writes its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
	/// `<output>`
	Plain,
	/// `<stem>.0.jpg`
	FirstFrame,
	Nothing,
}

/// Fails or succeeds per frame selection and writes `jpeg` according to `output`.
pub struct FakeConverter {
	pub fail_single: bool,
	pub fail_all: bool,
	pub output: Output,
	pub jpeg: Vec<u8>,
	pub calls: Mutex<Vec<(PathBuf, u8, FrameSelection)>>,
}

impl FakeConverter {
	pub fn new(output: Output) -> Self {
		Self {
			fail_single: false,
			fail_all: false,
			output,
			jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
			calls: Mutex::default(),
		}
	}

	pub fn calls(&self) -> Vec<(PathBuf, u8, FrameSelection)> {
		self.calls.lock().unwrap().clone()
	}
}

#[async_trait]
impl ImageConverter for FakeConverter {
	async fn convert(
		&self,
		input: &Path,
		output: &Path,
		quality: u8,
		frames: FrameSelection,
	) -> Result<(), ConvertError> {
		self.calls
			.lock()
			.unwrap()
			.push((input.to_path_buf(), quality, frames));

		let fail = match frames {
			FrameSelection::Single => self.fail_single,
			FrameSelection::All => self.fail_all,
		};
		if fail {
			return Err(ConvertError::Io(std::io::Error::other(format!(
				"conversion failed ({frames:?})"
			))));
		}

		match self.output {
			Output::Plain => std::fs::write(output, &self.jpeg)?,
			Output::FirstFrame => std::fs::write(frame_path(output, 0), &self.jpeg)?,
			Output::Nothing => {}
		}
		Ok(())
	}
}
