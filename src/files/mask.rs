//! Detector pixel masks.

use super::reader::FrameReader;
use crate::error::{Error, Result};
use crate::frame::{Frame, Shape};
use std::path::Path;

/// Per-pixel mask; masked pixels are replaced by a fill value.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorMask {
    shape: Shape,
    masked: Vec<bool>,
    fill: f32,
}

impl DetectorMask {
    /// Build a mask from a frame: every non-zero pixel is masked.
    pub fn from_frame(frame: &Frame, fill: f32) -> Self {
        Self {
            shape: frame.shape(),
            masked: frame.as_slice().iter().map(|&v| v != 0.0).collect(),
            fill,
        }
    }

    /// Load a mask file.
    pub fn load(reader: &dyn FrameReader, path: &Path, fill: f32) -> Result<Self> {
        let frame = reader.read(path).map_err(|e| {
            Error::Config(format!("cannot load detector mask {}: {e}", path.display()))
        })?;
        Ok(Self::from_frame(&frame, fill))
    }

    /// Mask shape.
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Number of masked pixels.
    pub fn masked_count(&self) -> usize {
        self.masked.iter().filter(|&&m| m).count()
    }

    /// Replace masked pixels of `frame` with the fill value.
    ///
    /// # Errors
    ///
    /// A shape mismatch is a configuration error: the mask does not belong to
    /// this detector.
    pub fn apply(&self, frame: &mut Frame) -> Result<()> {
        if frame.shape() != self.shape {
            return Err(Error::Config(format!(
                "detector mask is {} but frame is {}",
                self.shape,
                frame.shape()
            )));
        }
        for (v, &m) in frame.as_mut_slice().iter_mut().zip(&self.masked) {
            if m {
                *v = self.fill;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_mask() {
        let mask_frame = Frame::from_vec(Shape::new(2, 2), vec![0.0, 1.0, 0.0, 2.0]).unwrap();
        let mask = DetectorMask::from_frame(&mask_frame, -1.0);
        assert_eq!(mask.masked_count(), 2);

        let mut frame = Frame::filled(Shape::new(2, 2), 7.0);
        mask.apply(&mut frame).unwrap();
        assert_eq!(frame.as_slice(), &[7.0, -1.0, 7.0, -1.0]);
    }

    #[test]
    fn test_shape_mismatch_is_config_error() {
        let mask = DetectorMask::from_frame(&Frame::zeros(Shape::new(2, 2)), 0.0);
        let mut frame = Frame::zeros(Shape::new(3, 3));
        assert!(matches!(mask.apply(&mut frame), Err(Error::Config(_))));
    }
}
