//! Face samples and the raw-pixel face vector.
//!
//! A sample is the detector box cropped out of the frame and resampled to
//! 128×128 RGB. The vector is the sample's 8-bit intensities flattened in
//! memory order (row-major, interleaved channels) and cast to f32, with no
//! normalization.

use crate::types::{BoundingBox, FaceVector};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array2, Axis};
use thiserror::Error;

pub const SAMPLE_SIZE: u32 = 128;
pub const SAMPLE_CHANNELS: usize = 3;
/// Length of a flattened sample: 128 · 128 · 3.
pub const SAMPLE_LEN: usize = (SAMPLE_SIZE * SAMPLE_SIZE) as usize * SAMPLE_CHANNELS;

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("face region {bbox:?} is empty inside a {frame_width}x{frame_height} frame")]
    EmptyRegion {
        bbox: BoundingBox,
        frame_width: u32,
        frame_height: u32,
    },
    #[error("no face samples to vectorize")]
    NoSamples,
    #[error("sample buffer has {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// A 128×128 RGB face patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceSample {
    pixels: RgbImage,
}

impl FaceSample {
    /// Crop `bbox` out of `frame` and resample it to 128×128.
    ///
    /// The box is clipped to the frame first; nothing left is an error.
    pub fn from_region(frame: &RgbImage, bbox: &BoundingBox) -> Result<Self, SampleError> {
        let region = bbox
            .clip_to(frame.width(), frame.height())
            .ok_or(SampleError::EmptyRegion {
                bbox: *bbox,
                frame_width: frame.width(),
                frame_height: frame.height(),
            })?;

        let crop = imageops::crop_imm(frame, region.x, region.y, region.width, region.height)
            .to_image();

        let pixels = if crop.dimensions() == (SAMPLE_SIZE, SAMPLE_SIZE) {
            crop
        } else {
            imageops::resize(&crop, SAMPLE_SIZE, SAMPLE_SIZE, FilterType::Triangle)
        };

        Ok(Self { pixels })
    }

    /// Wrap an already-sized 128×128×3 buffer.
    pub fn from_raw(bytes: Vec<u8>) -> Result<Self, SampleError> {
        let actual = bytes.len();
        if actual != SAMPLE_LEN {
            return Err(SampleError::SizeMismatch {
                expected: SAMPLE_LEN,
                actual,
            });
        }
        RgbImage::from_raw(SAMPLE_SIZE, SAMPLE_SIZE, bytes)
            .map(|pixels| Self { pixels })
            .ok_or(SampleError::SizeMismatch {
                expected: SAMPLE_LEN,
                actual,
            })
    }

    pub fn image(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.pixels.as_raw()
    }

    /// Flatten to a float vector of length [`SAMPLE_LEN`].
    pub fn to_vector(&self) -> FaceVector {
        FaceVector::new(self.pixels.as_raw().iter().map(|&p| p as f32).collect())
    }
}

/// Element-wise mean of the samples, truncated back to 8 bits.
pub fn average(samples: &[FaceSample]) -> Result<FaceSample, SampleError> {
    match samples {
        [] => Err(SampleError::NoSamples),
        [only] => Ok(only.clone()),
        _ => {
            let flat: Vec<f32> = samples
                .iter()
                .flat_map(|s| s.as_bytes().iter().map(|&p| p as f32))
                .collect();
            let actual = flat.len();
            let stacked = Array2::from_shape_vec((samples.len(), SAMPLE_LEN), flat).map_err(
                |_| SampleError::SizeMismatch {
                    expected: samples.len() * SAMPLE_LEN,
                    actual,
                },
            )?;
            let mean = stacked.mean_axis(Axis(0)).ok_or(SampleError::NoSamples)?;

            // `as u8` truncates toward zero; the mean of 8-bit values stays in range.
            FaceSample::from_raw(mean.iter().map(|&v| v as u8).collect())
        }
    }
}

/// Build the face vector for one sample, or for the mean of several.
pub fn vectorize(samples: &[FaceSample]) -> Result<FaceVector, SampleError> {
    Ok(average(samples)?.to_vector())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient_frame(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    fn filled(value: u8) -> FaceSample {
        FaceSample::from_raw(vec![value; SAMPLE_LEN]).unwrap()
    }

    #[test]
    fn test_from_region_resizes_to_sample_size() {
        let frame = gradient_frame(640, 480);
        let sample = FaceSample::from_region(&frame, &BoundingBox::new(100, 50, 200, 260)).unwrap();
        assert_eq!(sample.image().dimensions(), (SAMPLE_SIZE, SAMPLE_SIZE));
        assert_eq!(sample.as_bytes().len(), SAMPLE_LEN);
    }

    #[test]
    fn test_from_region_exact_size_is_a_plain_crop() {
        let frame = gradient_frame(300, 300);
        let sample = FaceSample::from_region(&frame, &BoundingBox::new(10, 20, 128, 128)).unwrap();
        assert_eq!(sample.image().get_pixel(0, 0), frame.get_pixel(10, 20));
        assert_eq!(sample.image().get_pixel(127, 127), frame.get_pixel(137, 147));
    }

    #[test]
    fn test_from_region_empty_box() {
        let frame = gradient_frame(64, 64);
        let err = FaceSample::from_region(&frame, &BoundingBox::new(5, 5, 0, 10)).unwrap_err();
        assert!(matches!(err, SampleError::EmptyRegion { .. }));
    }

    #[test]
    fn test_from_region_outside_frame() {
        let frame = gradient_frame(64, 64);
        let err = FaceSample::from_region(&frame, &BoundingBox::new(64, 0, 10, 10)).unwrap_err();
        assert!(matches!(err, SampleError::EmptyRegion { .. }));
    }

    #[test]
    fn test_from_raw_rejects_wrong_length() {
        let err = FaceSample::from_raw(vec![0u8; SAMPLE_LEN + 3]).unwrap_err();
        assert!(matches!(
            err,
            SampleError::SizeMismatch { expected: SAMPLE_LEN, actual } if actual == SAMPLE_LEN + 3
        ));
    }

    #[test]
    fn test_vectorize_deterministic() {
        let frame = gradient_frame(320, 240);
        let bbox = BoundingBox::new(40, 30, 150, 170);
        let a = vectorize(&[FaceSample::from_region(&frame, &bbox).unwrap()]).unwrap();
        let b = vectorize(&[FaceSample::from_region(&frame, &bbox).unwrap()]).unwrap();
        assert_eq!(a.len(), SAMPLE_LEN);
        assert!(a
            .values()
            .iter()
            .zip(b.values())
            .all(|(x, y)| x.to_bits() == y.to_bits()));
    }

    #[test]
    fn test_vector_is_unnormalized_intensity() {
        let v = filled(200).to_vector();
        assert!(v.values().iter().all(|&x| x == 200.0));
    }

    #[test]
    fn test_average_of_identical_samples_is_idempotent() {
        let frame = gradient_frame(320, 240);
        let sample = FaceSample::from_region(&frame, &BoundingBox::new(0, 0, 200, 200)).unwrap();
        let mean = average(&[sample.clone(), sample.clone(), sample.clone()]).unwrap();
        assert_eq!(mean, sample);
        assert_eq!(
            vectorize(&[sample.clone(), sample.clone(), sample.clone()]).unwrap(),
            sample.to_vector()
        );
    }

    #[test]
    fn test_average_truncates() {
        // (10 + 11 + 11) / 3 = 10.67 -> 10
        let mean = average(&[filled(10), filled(11), filled(11)]).unwrap();
        assert!(mean.as_bytes().iter().all(|&p| p == 10));

        // (0 + 255 + 255) / 3 = 170
        let mean = average(&[filled(0), filled(255), filled(255)]).unwrap();
        assert!(mean.as_bytes().iter().all(|&p| p == 170));
    }

    #[test]
    fn test_average_requires_samples() {
        assert!(matches!(average(&[]), Err(SampleError::NoSamples)));
        assert!(matches!(vectorize(&[]), Err(SampleError::NoSamples)));
    }
}
