//! Frame type and raw-buffer to grayscale conversion.

use image::GrayImage;

/// A captured grayscale camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Take ownership of the pixels as an `image` buffer.
    pub fn into_image(self) -> Result<GrayImage, FrameError> {
        let expected = (self.width * self.height) as usize;
        let actual = self.data.len();
        GrayImage::from_raw(self.width, self.height, self.data)
            .ok_or(FrameError::InvalidLength { expected, actual })
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Downscale 16-bit little-endian grayscale to 8 bits by keeping the high byte.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if y16.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: y16.len(),
        });
    }
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// Copy an 8-bit grayscale buffer, dropping any driver padding past the image.
pub fn grey_to_grayscale(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize;
    grey.get(..expected)
        .map(<[u8]>::to_vec)
        .ok_or(FrameError::InvalidLength {
            expected,
            actual: grey.len(),
        })
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let gray = yuyv_to_grayscale(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_grayscale(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        let gray = y16_to_grayscale(&[0x34, 0x12, 0xFF, 0xAB], 2, 1).unwrap();
        assert_eq!(gray, vec![0x12, 0xAB]);
    }

    #[test]
    fn test_grey_trims_padding() {
        let gray = grey_to_grayscale(&[1, 2, 3, 4, 99, 99], 2, 2).unwrap();
        assert_eq!(gray, vec![1, 2, 3, 4]);
        assert!(grey_to_grayscale(&[1, 2, 3], 2, 2).is_err());
    }

    #[test]
    fn test_into_image() {
        let frame = Frame {
            data: vec![7; 6],
            width: 3,
            height: 2,
            timestamp: std::time::Instant::now(),
            sequence: 1,
        };
        let image = frame.into_image().unwrap();
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(image.get_pixel(2, 1).0[0], 7);
    }

    #[test]
    fn test_into_image_short_buffer() {
        let frame = Frame {
            data: vec![0; 5],
            width: 3,
            height: 2,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        };
        assert!(matches!(
            frame.into_image(),
            Err(FrameError::InvalidLength { expected: 6, actual: 5 })
        ));
    }
}
