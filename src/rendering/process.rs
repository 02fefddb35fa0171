use super::{ConvertError, FrameSelection, ImageConverter};
use crate::config::ProcessRendererConfig;
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Runs an external conversion tool such as `dcmj2pnm` from DCMTK.
///
/// The command line is `<program> <args> <quality-flag> <quality> <frame args> <input> <output>`.
#[derive(Debug, Clone)]
pub struct ProcessConverter {
	config: ProcessRendererConfig,
}

impl ProcessConverter {
	pub const fn new(config: ProcessRendererConfig) -> Self {
		Self { config }
	}

	fn command(&self, input: &Path, output: &Path, quality: u8, frames: FrameSelection) -> Command {
		let frame_args = match frames {
			FrameSelection::Single => &self.config.single_frame_args,
			FrameSelection::All => &self.config.all_frames_args,
		};

		let mut command = Command::new(&self.config.program);
		command
			.args(&self.config.args)
			.arg(&self.config.quality_flag)
			.arg(quality.to_string())
			.args(frame_args)
			.arg(input)
			.arg(output)
			.kill_on_drop(true);
		command
	}
}

#[async_trait]
impl ImageConverter for ProcessConverter {
	#[instrument(skip_all, fields(input = %input.display(), quality))]
	async fn convert(
		&self,
		input: &Path,
		output: &Path,
		quality: u8,
		frames: FrameSelection,
	) -> Result<(), ConvertError> {
		let result = self
			.command(input, output, quality, frames)
			.output()
			.await
			.map_err(|source| ConvertError::Spawn {
				program: self.config.program.clone(),
				source,
			})?;

		if !result.status.success() {
			return Err(ConvertError::ExitStatus {
				program: self.config.program.clone(),
				status: result.status,
				stderr: String::from_utf8_lossy(&result.stderr).trim().to_owned(),
			});
		}

		debug!(?frames, "Conversion finished");
		Ok(())
	}
}

#[cfg(all(test, unix))]
mod tests {
	use super::*;

	fn converter(program: &str, args: &[&str]) -> ProcessConverter {
		ProcessConverter::new(ProcessRendererConfig {
			program: program.to_owned(),
			args: args.iter().map(ToString::to_string).collect(),
			quality_flag: String::from("--quality"),
			single_frame_args: vec![String::from("--single")],
			all_frames_args: vec![String::from("--all")],
		})
	}

	#[tokio::test]
	async fn passes_arguments_in_order() {
		let dir = tempfile::tempdir().unwrap();
		let input = dir.path().join("in");
		let output = dir.path().join("in.jpg");
		// `sh -c <script> <$0> <$1>...` records the remaining arguments in the output file.
		let script = r#"for last; do :; done; printf '%s ' "$@" > "$last""#;

		converter("sh", &["-c", script, "sh"])
			.convert(&input, &output, 10, FrameSelection::All)
			.await
			.unwrap();

		let recorded = std::fs::read_to_string(&output).unwrap();
		assert_eq!(
			recorded.trim_end(),
			format!("--quality 10 --all {} {}", input.display(), output.display())
		);
	}

	#[tokio::test]
	async fn non_zero_exit_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let input = dir.path().join("in");
		let output = dir.path().join("in.jpg");

		let result = converter("sh", &["-c", "echo broken >&2; exit 3", "sh"])
			.convert(&input, &output, 100, FrameSelection::Single)
			.await;

		match result {
			Err(ConvertError::ExitStatus { stderr, status, .. }) => {
				assert_eq!(stderr, "broken");
				assert_eq!(status.code(), Some(3));
			}
			other => panic!("unexpected result {other:?}"),
		}
	}

	#[tokio::test]
	async fn missing_program_is_a_spawn_error() {
		let dir = tempfile::tempdir().unwrap();

		let result = converter("/nonexistent/dcmj2pnm", &[])
			.convert(
				&dir.path().join("in"),
				&dir.path().join("in.jpg"),
				100,
				FrameSelection::Single,
			)
			.await;

		assert!(matches!(result, Err(ConvertError::Spawn { .. })));
	}
}
