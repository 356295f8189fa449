//! Two-dimensional frame data.
//!
//! A [`Frame`] is a row-major `f32` array, the unit of data flowing through
//! pipelines and through the shared frame buffer.

use crate::error::{Error, Result};

/// Height and width of a frame.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct Shape {
    /// Number of rows.
    pub height: usize,
    /// Number of columns.
    pub width: usize,
}

impl Shape {
    /// Create a new shape.
    pub const fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.height * self.width
    }

    /// Returns true if either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this shape fits inside `other`.
    pub fn fits_within(&self, other: Shape) -> bool {
        self.height <= other.height && self.width <= other.width
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// A row-major 2-D array of `f32` values.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct Frame {
    shape: Shape,
    data: Vec<f32>,
}

impl Frame {
    /// Create a frame filled with `value`.
    pub fn filled(shape: Shape, value: f32) -> Self {
        Self {
            shape,
            data: vec![value; shape.len()],
        }
    }

    /// Create a zero-filled frame.
    pub fn zeros(shape: Shape) -> Self {
        Self::filled(shape, 0.0)
    }

    /// Wrap existing row-major data.
    ///
    /// # Errors
    ///
    /// Fails if `data.len()` does not match the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(Error::InvalidSegment(format!(
                "frame data has {} values, shape {} needs {}",
                data.len(),
                shape,
                shape.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// The frame's shape.
    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Number of rows.
    #[inline]
    pub fn height(&self) -> usize {
        self.shape.height
    }

    /// Number of columns.
    #[inline]
    pub fn width(&self) -> usize {
        self.shape.width
    }

    /// Row-major values.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable row-major values.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// One row of the frame.
    pub fn row(&self, y: usize) -> &[f32] {
        let start = y * self.shape.width;
        &self.data[start..start + self.shape.width]
    }

    /// Value at `(y, x)`, if in bounds.
    pub fn get(&self, y: usize, x: usize) -> Option<f32> {
        if y < self.shape.height && x < self.shape.width {
            Some(self.data[y * self.shape.width + x])
        } else {
            None
        }
    }

    /// Consume the frame, returning its values.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Apply `f` to every value in place.
    pub fn map_in_place(&mut self, f: impl Fn(f32) -> f32) {
        for v in &mut self.data {
            *v = f(*v);
        }
    }

    /// Element-wise `self - other`.
    ///
    /// # Errors
    ///
    /// Fails if the shapes differ.
    pub fn subtract(&mut self, other: &Frame) -> Result<()> {
        if self.shape != other.shape {
            return Err(Error::InvalidSegment(format!(
                "cannot subtract {} frame from {} frame",
                other.shape, self.shape
            )));
        }
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a -= *b;
        }
        Ok(())
    }

    /// Copy out the rectangle `[y0, y1) x [x0, x1)`.
    ///
    /// # Errors
    ///
    /// Fails if the rectangle is empty or exceeds the frame.
    pub fn crop(&self, y0: usize, y1: usize, x0: usize, x1: usize) -> Result<Frame> {
        if y0 >= y1 || x0 >= x1 || y1 > self.shape.height || x1 > self.shape.width {
            return Err(Error::InvalidSegment(format!(
                "crop [{y0}:{y1}, {x0}:{x1}] is invalid for a {} frame",
                self.shape
            )));
        }
        let shape = Shape::new(y1 - y0, x1 - x0);
        let mut data = Vec::with_capacity(shape.len());
        for y in y0..y1 {
            data.extend_from_slice(&self.row(y)[x0..x1]);
        }
        Ok(Frame { shape, data })
    }

    /// Smallest, largest and mean value, ignoring NaNs.
    ///
    /// Returns `None` if the frame holds no finite values.
    pub fn statistics(&self) -> Option<(f32, f32, f64)> {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0f64;
        let mut count = 0usize;
        for &v in self.data.iter().filter(|v| !v.is_nan()) {
            min = min.min(v);
            max = max.max(v);
            sum += f64::from(v);
            count += 1;
        }
        (count > 0).then(|| (min, max, sum / count as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filled_frame() {
        let frame = Frame::filled(Shape::new(2, 3), 1.5);
        assert_eq!(frame.shape(), Shape::new(2, 3));
        assert_eq!(frame.as_slice().len(), 6);
        assert!(frame.as_slice().iter().all(|&v| v == 1.5));
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        assert!(Frame::from_vec(Shape::new(2, 2), vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_crop() {
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let frame = Frame::from_vec(Shape::new(3, 4), data).unwrap();
        let cropped = frame.crop(1, 3, 1, 3).unwrap();
        assert_eq!(cropped.shape(), Shape::new(2, 2));
        assert_eq!(cropped.as_slice(), &[5.0, 6.0, 9.0, 10.0]);
        assert!(frame.crop(0, 4, 0, 1).is_err());
        assert!(frame.crop(2, 2, 0, 1).is_err());
    }

    #[test]
    fn test_statistics_skip_nan() {
        let frame = Frame::from_vec(Shape::new(1, 4), vec![1.0, f32::NAN, 3.0, 2.0]).unwrap();
        let (min, max, mean) = frame.statistics().unwrap();
        assert_eq!(min, 1.0);
        assert_eq!(max, 3.0);
        assert!((mean - 2.0).abs() < 1e-9);
        assert!(Frame::filled(Shape::new(1, 1), f32::NAN).statistics().is_none());
    }

    #[test]
    fn test_subtract_shape_mismatch() {
        let mut a = Frame::zeros(Shape::new(2, 2));
        assert!(a.subtract(&Frame::zeros(Shape::new(2, 3))).is_err());
        a.subtract(&Frame::filled(Shape::new(2, 2), 1.0)).unwrap();
        assert!(a.as_slice().iter().all(|&v| v == -1.0));
    }
}
