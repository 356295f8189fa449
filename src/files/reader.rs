//! Frame file decoding.

use crate::error::{Error, Result};
use crate::frame::{Frame, Shape};
use image::DynamicImage;
use std::path::Path;

/// File extensions handled by [`ImageFrameReader`].
pub const IMAGE_EXTENSIONS: &[&str] = &["tif", "tiff", "png"];

/// Decodes frame files into [`Frame`]s.
pub trait FrameReader: Send + Sync {
    /// Read the whole file as one frame.
    fn read(&self, path: &Path) -> Result<Frame>;

    /// Read the last frame of a named dataset inside a container file.
    ///
    /// Readers for single-frame formats report [`Error::NotFound`].
    fn read_last_frame(&self, path: &Path, dataset: &str) -> Result<Frame> {
        Err(Error::NotFound(format!(
            "dataset '{dataset}' in {}: format has no datasets",
            path.display()
        )))
    }

    /// Frame dimensions without decoding pixel data.
    fn dimensions(&self, path: &Path) -> Result<Shape>;
}

/// Reader for single-frame image formats (TIFF, PNG) via the `image` crate.
///
/// Integer pixels keep their raw detector counts; colour images are reduced
/// to luminance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFrameReader;

impl ImageFrameReader {
    /// Create a new reader.
    pub fn new() -> Self {
        Self
    }

    fn check_extension(path: &Path) -> Result<()> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Ok(())
        } else {
            Err(Error::NotFound(format!(
                "no frame reader registered for extension '{ext}' ({})",
                path.display()
            )))
        }
    }
}

impl FrameReader for ImageFrameReader {
    fn read(&self, path: &Path) -> Result<Frame> {
        Self::check_extension(path)?;
        let img = image::open(path)?;
        let shape = Shape::new(img.height() as usize, img.width() as usize);

        let data: Vec<f32> = match img {
            DynamicImage::ImageLuma8(buf) => buf.into_raw().into_iter().map(f32::from).collect(),
            DynamicImage::ImageLuma16(buf) => buf.into_raw().into_iter().map(f32::from).collect(),
            other => other.to_luma32f().into_raw(),
        };

        Frame::from_vec(shape, data)
    }

    fn dimensions(&self, path: &Path) -> Result<Shape> {
        Self::check_extension(path)?;
        let (width, height) = image::ImageReader::open(path)?
            .with_guessed_format()?
            .into_dimensions()?;
        Ok(Shape::new(height as usize, width as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn write_tiff(path: &Path, width: u32, height: u32, value: u16) {
        let img: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_pixel(width, height, Luma([value]));
        img.save(path).unwrap();
    }

    #[test]
    fn test_read_tiff_keeps_raw_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.tif");
        write_tiff(&path, 4, 3, 1234);

        let frame = ImageFrameReader::new().read(&path).unwrap();
        assert_eq!(frame.shape(), Shape::new(3, 4));
        assert!(frame.as_slice().iter().all(|&v| v == 1234.0));
    }

    #[test]
    fn test_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.tif");
        write_tiff(&path, 7, 5, 0);
        assert_eq!(
            ImageFrameReader::new().dimensions(&path).unwrap(),
            Shape::new(5, 7)
        );
    }

    #[test]
    fn test_unknown_extension_not_found() {
        let err = ImageFrameReader::new()
            .read(Path::new("/tmp/frame.h5"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_truncated_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.tif");
        write_tiff(&path, 16, 16, 5);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 3]).unwrap();
        assert!(ImageFrameReader::new().read(&path).is_err());
    }

    #[test]
    fn test_last_frame_unsupported() {
        let err = ImageFrameReader::new()
            .read_last_frame(Path::new("x.tif"), "entry/data")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
