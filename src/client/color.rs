use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::io::Cursor;
use std::path::Path;

use super::recording::RecordingError;

/// Quality used when rewriting corrected frames
const REENCODE_QUALITY: u8 = 95;

/// Swap the first and third channel of every pixel. The producer ships its
/// sensor's BGR buffer through an RGB encoder, so this restores true color.
pub fn swap_red_blue(img: &mut RgbImage) {
    for pixel in img.pixels_mut() {
        pixel.0.swap(0, 2);
    }
}

/// Decode a JPEG, swap red and blue, and re-encode.
pub fn correct_jpeg(data: &[u8]) -> Result<Vec<u8>, RecordingError> {
    let mut img = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?.to_rgb8();
    swap_red_blue(&mut img);

    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, REENCODE_QUALITY);
    img.write_with_encoder(encoder)?;
    Ok(buf.into_inner())
}

/// Rewrite one frame file in place.
pub fn correct_file(path: &Path) -> Result<(), RecordingError> {
    let data = std::fs::read(path)?;
    let corrected = correct_jpeg(&data)?;
    std::fs::write(path, corrected)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid_jpeg(rgb: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(16, 16, Rgb(rgb));
        let mut buf = Cursor::new(Vec::new());
        img.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, 100))
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_swap_red_blue() {
        let mut img = RgbImage::from_pixel(2, 2, Rgb([10, 20, 30]));
        swap_red_blue(&mut img);
        assert!(img.pixels().all(|p| p.0 == [30, 20, 10]));
    }

    #[test]
    fn test_correct_jpeg_swaps_channels() {
        let corrected = correct_jpeg(&solid_jpeg([220, 40, 10])).unwrap();
        let img = image::load_from_memory(&corrected).unwrap().to_rgb8();
        let p = img.get_pixel(8, 8).0;
        // Lossy codec: compare with tolerance
        assert!(p[0] < 40, "red was {}", p[0]);
        assert!(p[2] > 190, "blue was {}", p[2]);
    }

    #[test]
    fn test_correct_jpeg_rejects_garbage() {
        assert!(matches!(
            correct_jpeg(b"not a jpeg"),
            Err(RecordingError::Image(_))
        ));
    }
}
