use super::{frame_path, ConvertError, FrameSelection, ImageConverter};
use async_trait::async_trait;
use dicom::object::open_file;
use dicom_pixeldata::image::DynamicImage;
use dicom_pixeldata::{ConvertOptions, PixelDecoder};
use image::codecs::jpeg::JpegEncoder;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{instrument, trace};

/// Renders with the dicom-pixeldata decoders and the JPEG encoder of the image crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct PixelDataConverter;

impl PixelDataConverter {
	fn convert_blocking(
		input: &Path,
		output: &Path,
		quality: u8,
		frames: FrameSelection,
	) -> Result<(), ConvertError> {
		let dicom_file = open_file(input)?;
		let pixel_data = dicom_file.decode_pixel_data()?;
		let number_of_frames = pixel_data.number_of_frames();
		let options = ConvertOptions::default().force_8bit();

		match frames {
			FrameSelection::Single => {
				if number_of_frames > 1 {
					return Err(ConvertError::MultiFrame(number_of_frames));
				}
				let image = pixel_data.to_dynamic_image_with_options(0, &options)?;
				write_jpeg(&image, output, quality)
			}
			FrameSelection::All => {
				for index in 0..number_of_frames {
					trace!(index, "Rendering frame");
					let image = pixel_data.to_dynamic_image_with_options(index, &options)?;
					write_jpeg(&image, &frame_path(output, index), quality)?;
				}
				Ok(())
			}
		}
	}
}

fn write_jpeg(image: &DynamicImage, path: &Path, quality: u8) -> Result<(), ConvertError> {
	let mut writer = BufWriter::new(File::create(path)?);
	let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
	image.write_with_encoder(encoder)?;
	Ok(())
}

#[async_trait]
impl ImageConverter for PixelDataConverter {
	#[instrument(skip_all, fields(input = %input.display(), quality))]
	async fn convert(
		&self,
		input: &Path,
		output: &Path,
		quality: u8,
		frames: FrameSelection,
	) -> Result<(), ConvertError> {
		let input: PathBuf = input.to_path_buf();
		let output: PathBuf = output.to_path_buf();
		tokio::task::spawn_blocking(move || {
			Self::convert_blocking(&input, &output, quality, frames)
		})
		.await?
	}
}
