//! Frame files on disk: naming patterns, decoding and detector masks.

mod mask;
mod pattern;
mod reader;

pub use mask::DetectorMask;
pub use pattern::FilenamePattern;
pub use reader::{FrameReader, IMAGE_EXTENSIONS, ImageFrameReader};
