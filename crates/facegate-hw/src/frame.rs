//! Frame type and pixel conversion (YUYV to RGB, horizontal mirroring).

use image::imageops;
use image::RgbImage;
use std::time::Instant;

/// A captured, mirrored RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Capture time; drives the session state machines.
    pub timestamp: Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Average luma (0.0–255.0), BT.601 weights.
    pub fn avg_brightness(&self) -> f32 {
        let pixels = self.image.width() as usize * self.image.height() as usize;
        if pixels == 0 {
            return 0.0;
        }
        let sum: f32 = self
            .image
            .pixels()
            .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
            .sum();
        sum / pixels as f32
    }
}

/// Mirror a frame left-to-right, so the preview behaves like a mirror.
pub fn mirror(image: &mut RgbImage) {
    imageops::flip_horizontal_in_place(image);
}

/// Convert packed YUYV (4:2:2) to RGB using integer BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    let expected = pixels * 2;
    if yuyv.len() < expected || width % 2 != 0 {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (chunk[1] as i32 - 128, chunk[3] as i32 - 128);
        for y in [chunk[0], chunk[2]] {
            let c = 298 * (y as i32 - 16);
            rgb.push(clamp_u8((c + 409 * v + 128) >> 8));
            rgb.push(clamp_u8((c - 100 * u - 208 * v + 128) >> 8));
            rgb.push(clamp_u8((c + 516 * u + 128) >> 8));
        }
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_yuyv_white_and_black() {
        // 2x1 image: Y0=235 (white), Y1=16 (black), neutral chroma.
        let yuyv = vec![235, 128, 16, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_yuyv_red_chroma() {
        // High V pushes red up and green down.
        let yuyv = vec![128, 128, 128, 240];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        let p = rgb.get_pixel(0, 0);
        assert!(p[0] > 200, "red = {}", p[0]);
        assert!(p[1] < 100, "green = {}", p[1]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(yuyv_to_rgb(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_mirror_swaps_columns() {
        let mut img = RgbImage::from_fn(3, 1, |x, _| Rgb([x as u8, 0, 0]));
        mirror(&mut img);
        assert_eq!(img.get_pixel(0, 0)[0], 2);
        assert_eq!(img.get_pixel(2, 0)[0], 0);
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame {
            image: RgbImage::from_pixel(4, 4, Rgb([100, 100, 100])),
            timestamp: Instant::now(),
            sequence: 0,
        };
        assert!((frame.avg_brightness() - 100.0).abs() < 1e-3);
    }
}
