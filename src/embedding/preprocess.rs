//! Image decoding and conversion to backbone input tensors.

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use super::embedder::{EmbeddingError, Result};
use crate::domain::{BoundingBox, ImageRecord};

/// Side length of the square network input.
pub const DEFAULT_INPUT_SIZE: u32 = 300;

/// Turns image files into `[1, 3, S, S]` tensors with values in `[0, 1]`.
///
/// Steps: decode (JPEG/PNG), optional crop to the record's bounding box,
/// bilinear resize to `S x S`, scale by 1/255, channel-first layout.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    input_size: u32,
    device: Device,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_SIZE, Device::Cpu)
    }
}

impl ImagePreprocessor {
    pub fn new(input_size: u32, device: Device) -> Self {
        Self { input_size, device }
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Decodes the record's file and prepares it.
    pub fn load(&self, record: &ImageRecord) -> Result<Tensor> {
        let image = image::open(&record.path).map_err(|e| EmbeddingError::MalformedImage {
            path: record.path.clone(),
            reason: e.to_string(),
        })?;
        self.prepare(&image, record.bbox.as_ref())
    }

    /// Crops, resizes and converts a decoded image.
    pub fn prepare(&self, image: &DynamicImage, bbox: Option<&BoundingBox>) -> Result<Tensor> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(EmbeddingError::InputShape {
                expected: "a non-empty image".to_string(),
                actual: vec![height as usize, width as usize],
            });
        }

        let size = self.input_size;
        let resized = match bbox {
            Some(bbox) => {
                let (x, y, w, h) = bbox.to_pixel_region(width, height).ok_or(
                    EmbeddingError::InvalidBoundingBox {
                        bbox: *bbox,
                        width,
                        height,
                    },
                )?;
                image
                    .crop_imm(x, y, w, h)
                    .resize_exact(size, size, FilterType::Triangle)
            }
            None => image.resize_exact(size, size, FilterType::Triangle),
        };

        let rgb = resized.to_rgb8();
        let side = size as usize;
        let tensor = Tensor::from_vec(rgb.into_raw(), (side, side, 3), &self.device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?
            .unsqueeze(0)?
            .contiguous()?;
        Ok(tensor)
    }
}
