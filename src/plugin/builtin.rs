//! Built-in plugins, registered explicitly through
//! [`register_builtin_plugins`].

use super::params::{ParameterSet, SideChannel};
use super::registry::{PluginClass, PluginRegistry};
use super::traits::{Payload, Plugin, PluginFactory, PluginKind};
use crate::error::{Error, Result};
use crate::files::{FilenamePattern, FrameReader, ImageFrameReader};
use crate::frame::{Frame, Shape};
use std::path::PathBuf;

/// Implements the accessor half of [`Plugin`] for a struct with a
/// `params: ParameterSet` field.
macro_rules! plugin_accessors {
    ($name:literal, $kind:expr) => {
        fn name(&self) -> &str {
            $name
        }

        fn kind(&self) -> PluginKind {
            $kind
        }

        fn parameters(&self) -> &ParameterSet {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut ParameterSet {
            &mut self.params
        }
    };
}

// ============================================================================
// Input plugins
// ============================================================================

/// Emits a constant frame for every index.
///
/// Parameters: `height`, `width`, `value`.
#[derive(Debug)]
pub struct ConstantSource {
    params: ParameterSet,
}

impl ConstantSource {
    const NAME: &'static str = "constant_source";

    fn defaults() -> ParameterSet {
        ParameterSet::new()
            .with("height", 10i64)
            .with("width", 10i64)
            .with("value", 0.0)
    }

    fn create(params: ParameterSet) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(Self { params }))
    }

    fn shape(&self) -> Shape {
        Shape::new(
            self.params.usize_or("height", 10),
            self.params.usize_or("width", 10),
        )
    }
}

impl Plugin for ConstantSource {
    plugin_accessors!("constant_source", PluginKind::Input);

    fn execute(&mut self, data: Payload, mut side: SideChannel) -> Result<(Payload, SideChannel)> {
        let index = data.into_index(Self::NAME)?;
        let value = self.params.f64_or("value", 0.0) as f32;
        side.insert("index", index as i64);
        Ok((Payload::Frame(Frame::filled(self.shape(), value)), side))
    }

    fn calculate_result_shape(&mut self, _input: Option<Shape>) -> Result<Shape> {
        Ok(self.shape())
    }
}

/// Loads the frame file for each index from a directory.
///
/// Parameters: `directory`, `pattern` (see [`FilenamePattern`]),
/// `first_index` (file used to derive the result shape).
#[derive(Debug)]
pub struct FileSource {
    params: ParameterSet,
    reader: ImageFrameReader,
}

impl FileSource {
    const NAME: &'static str = "file_source";

    fn defaults() -> ParameterSet {
        ParameterSet::new()
            .with("directory", ".")
            .with("pattern", "frame_{index:04}.tif")
            .with("first_index", 0i64)
    }

    fn create(params: ParameterSet) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(Self {
            params,
            reader: ImageFrameReader::new(),
        }))
    }

    fn resolve(&self) -> Result<(PathBuf, FilenamePattern)> {
        let dir = PathBuf::from(self.params.string("directory").unwrap_or_default());
        let pattern = self
            .params
            .string("pattern")
            .ok_or_else(|| Error::Config("file_source requires a 'pattern'".into()))?;
        Ok((dir, FilenamePattern::parse(&pattern)?))
    }
}

impl Plugin for FileSource {
    plugin_accessors!("file_source", PluginKind::Input);

    fn pre_execute(&mut self) -> Result<()> {
        let (dir, _) = self.resolve()?;
        if !dir.is_dir() {
            return Err(Error::Config(format!(
                "file_source directory {} does not exist",
                dir.display()
            )));
        }
        Ok(())
    }

    fn execute(&mut self, data: Payload, mut side: SideChannel) -> Result<(Payload, SideChannel)> {
        let index = data.into_index(Self::NAME)?;
        let (dir, pattern) = self.resolve()?;
        let path = pattern.path(&dir, index);
        let frame = self.reader.read(&path)?;
        side.insert("index", index as i64);
        side.insert("path", path.display().to_string());
        Ok((Payload::Frame(frame), side))
    }

    fn calculate_result_shape(&mut self, _input: Option<Shape>) -> Result<Shape> {
        let (dir, pattern) = self.resolve()?;
        let first = self.params.usize_or("first_index", 0) as u64;
        self.reader.dimensions(&pattern.path(&dir, first))
    }
}

// ============================================================================
// Processing plugins
// ============================================================================

/// Raises every value below `threshold` up to `threshold`.
#[derive(Debug)]
pub struct ClampLow {
    params: ParameterSet,
}

impl ClampLow {
    const NAME: &'static str = "clamp_low";

    fn defaults() -> ParameterSet {
        ParameterSet::new().with("threshold", 0.0)
    }

    fn create(params: ParameterSet) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(Self { params }))
    }
}

impl Plugin for ClampLow {
    plugin_accessors!("clamp_low", PluginKind::Processing);

    fn execute(&mut self, data: Payload, side: SideChannel) -> Result<(Payload, SideChannel)> {
        let mut frame = data.into_frame(Self::NAME)?;
        let threshold = self.params.f64_or("threshold", 0.0) as f32;
        frame.map_in_place(|v| if v < threshold { threshold } else { v });
        Ok((Payload::Frame(frame), side))
    }

    fn calculate_result_shape(&mut self, input: Option<Shape>) -> Result<Shape> {
        input.ok_or_else(|| Error::plugin(Self::NAME, "needs an input shape"))
    }
}

/// Computes `value * factor + offset`.
#[derive(Debug)]
pub struct Scale {
    params: ParameterSet,
}

impl Scale {
    const NAME: &'static str = "scale";

    fn defaults() -> ParameterSet {
        ParameterSet::new().with("factor", 1.0).with("offset", 0.0)
    }

    fn create(params: ParameterSet) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(Self { params }))
    }
}

impl Plugin for Scale {
    plugin_accessors!("scale", PluginKind::Processing);

    fn execute(&mut self, data: Payload, side: SideChannel) -> Result<(Payload, SideChannel)> {
        let mut frame = data.into_frame(Self::NAME)?;
        let factor = self.params.f64_or("factor", 1.0) as f32;
        let offset = self.params.f64_or("offset", 0.0) as f32;
        frame.map_in_place(|v| v * factor + offset);
        Ok((Payload::Frame(frame), side))
    }

    fn calculate_result_shape(&mut self, input: Option<Shape>) -> Result<Shape> {
        input.ok_or_else(|| Error::plugin(Self::NAME, "needs an input shape"))
    }
}

/// Crops the region `[y0, y1) x [x0, x1)`.
///
/// `y1`/`x1` default to the input's full extent.
#[derive(Debug)]
pub struct Crop {
    params: ParameterSet,
}

impl Crop {
    const NAME: &'static str = "crop";

    fn defaults() -> ParameterSet {
        ParameterSet::new().with("y0", 0i64).with("x0", 0i64)
    }

    fn create(params: ParameterSet) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(Self { params }))
    }

    fn bounds(&self, input: Shape) -> Result<(usize, usize, usize, usize)> {
        let y0 = self.params.usize_or("y0", 0);
        let x0 = self.params.usize_or("x0", 0);
        let y1 = self.params.usize_or("y1", input.height);
        let x1 = self.params.usize_or("x1", input.width);
        if y0 >= y1 || x0 >= x1 || y1 > input.height || x1 > input.width {
            return Err(Error::plugin(
                Self::NAME,
                format!("region [{y0}:{y1}, {x0}:{x1}] does not fit a {input} frame"),
            ));
        }
        Ok((y0, y1, x0, x1))
    }
}

impl Plugin for Crop {
    plugin_accessors!("crop", PluginKind::Processing);

    fn execute(&mut self, data: Payload, side: SideChannel) -> Result<(Payload, SideChannel)> {
        let frame = data.into_frame(Self::NAME)?;
        let (y0, y1, x0, x1) = self.bounds(frame.shape())?;
        Ok((Payload::Frame(frame.crop(y0, y1, x0, x1)?), side))
    }

    fn calculate_result_shape(&mut self, input: Option<Shape>) -> Result<Shape> {
        let input = input.ok_or_else(|| Error::plugin(Self::NAME, "needs an input shape"))?;
        let (y0, y1, x0, x1) = self.bounds(input)?;
        Ok(Shape::new(y1 - y0, x1 - x0))
    }
}

// ============================================================================
// Output plugins
// ============================================================================

/// Records `min`, `max` and `mean` of the frame in the side channel and
/// passes the frame through.
#[derive(Debug)]
pub struct FrameStatistics {
    params: ParameterSet,
}

impl FrameStatistics {
    const NAME: &'static str = "frame_statistics";

    fn defaults() -> ParameterSet {
        ParameterSet::new().with("prefix", "")
    }

    fn create(params: ParameterSet) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(Self { params }))
    }
}

impl Plugin for FrameStatistics {
    plugin_accessors!("frame_statistics", PluginKind::Output);

    fn execute(&mut self, data: Payload, mut side: SideChannel) -> Result<(Payload, SideChannel)> {
        let frame = data.into_frame(Self::NAME)?;
        let prefix = self.params.string("prefix").unwrap_or_default();
        if let Some((min, max, mean)) = frame.statistics() {
            side.insert(format!("{prefix}min"), f64::from(min));
            side.insert(format!("{prefix}max"), f64::from(max));
            side.insert(format!("{prefix}mean"), mean);
        }
        Ok((Payload::Frame(frame), side))
    }

    fn calculate_result_shape(&mut self, input: Option<Shape>) -> Result<Shape> {
        input.ok_or_else(|| Error::plugin(Self::NAME, "needs an input shape"))
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Every built-in as `(name, kind, description, defaults, factory)`.
fn builtins() -> Vec<(&'static str, PluginKind, &'static str, ParameterSet, PluginFactory)> {
    vec![
        (
            ConstantSource::NAME,
            PluginKind::Input,
            "Emit a constant frame for every index",
            ConstantSource::defaults(),
            ConstantSource::create,
        ),
        (
            FileSource::NAME,
            PluginKind::Input,
            "Load the frame file for each index",
            FileSource::defaults(),
            FileSource::create,
        ),
        (
            ClampLow::NAME,
            PluginKind::Processing,
            "Raise values below a threshold to the threshold",
            ClampLow::defaults(),
            ClampLow::create,
        ),
        (
            Scale::NAME,
            PluginKind::Processing,
            "Multiply by a factor and add an offset",
            Scale::defaults(),
            Scale::create,
        ),
        (
            Crop::NAME,
            PluginKind::Processing,
            "Crop a rectangular region",
            Crop::defaults(),
            Crop::create,
        ),
        (
            FrameStatistics::NAME,
            PluginKind::Output,
            "Record min/max/mean in the side channel",
            FrameStatistics::defaults(),
            FrameStatistics::create,
        ),
    ]
}

/// Register the built-in implementations and a plugin class for each.
///
/// Existing class bindings with the same names are left untouched.
pub fn register_builtin_plugins(registry: &PluginRegistry) {
    for (name, kind, description, defaults, factory) in builtins() {
        registry.register_implementation(name, kind, factory);
        registry.register_class(
            PluginClass::new(name, kind, name)
                .with_description(description)
                .with_defaults(defaults),
            false,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(value: f32) -> Payload {
        Payload::Frame(Frame::filled(Shape::new(2, 2), value))
    }

    #[test]
    fn test_constant_source() {
        let mut p = ConstantSource::create(
            ConstantSource::defaults()
                .with("height", 3i64)
                .with("width", 4i64)
                .with("value", 2.5),
        )
        .unwrap();
        let (out, side) = p.execute(Payload::Index(7), SideChannel::new()).unwrap();
        let frame = out.into_frame("t").unwrap();
        assert_eq!(frame.shape(), Shape::new(3, 4));
        assert!(frame.as_slice().iter().all(|&v| v == 2.5));
        assert_eq!(side.get("index").and_then(|v| v.as_i64()), Some(7));
        assert_eq!(p.calculate_result_shape(None).unwrap(), Shape::new(3, 4));
    }

    #[test]
    fn test_constant_source_rejects_frame() {
        let mut p = ConstantSource::create(ConstantSource::defaults()).unwrap();
        assert!(p.execute(frame_of(1.0), SideChannel::new()).is_err());
    }

    #[test]
    fn test_clamp_low() {
        let mut p = ClampLow::create(ClampLow::defaults().with("threshold", 5.0)).unwrap();
        let data = Frame::from_vec(Shape::new(1, 3), vec![3.0, 5.0, 8.0]).unwrap();
        let (out, _) = p.execute(Payload::Frame(data), SideChannel::new()).unwrap();
        assert_eq!(out.into_frame("t").unwrap().as_slice(), &[5.0, 5.0, 8.0]);
    }

    #[test]
    fn test_scale_uses_mutated_parameters() {
        let mut p = Scale::create(Scale::defaults()).unwrap();
        p.parameters_mut().set("factor", 2.0);
        p.parameters_mut().set("offset", 1.0);
        let (out, _) = p.execute(frame_of(3.0), SideChannel::new()).unwrap();
        assert!(out.into_frame("t").unwrap().as_slice().iter().all(|&v| v == 7.0));
    }

    #[test]
    fn test_crop_shape() {
        let mut p = Crop::create(
            Crop::defaults()
                .with("y0", 1i64)
                .with("y1", 4i64)
                .with("x1", 2i64),
        )
        .unwrap();
        assert_eq!(
            p.calculate_result_shape(Some(Shape::new(10, 10))).unwrap(),
            Shape::new(3, 2)
        );
        assert!(p.calculate_result_shape(Some(Shape::new(2, 2))).is_err());
        assert!(p.calculate_result_shape(None).is_err());
    }

    #[test]
    fn test_frame_statistics() {
        let mut p = FrameStatistics::create(FrameStatistics::defaults()).unwrap();
        let data = Frame::from_vec(Shape::new(1, 2), vec![1.0, 3.0]).unwrap();
        let (out, side) = p.execute(Payload::Frame(data), SideChannel::new()).unwrap();
        assert!(out.as_frame().is_some());
        assert_eq!(side.get("min").and_then(|v| v.as_f64()), Some(1.0));
        assert_eq!(side.get("max").and_then(|v| v.as_f64()), Some(3.0));
        assert_eq!(side.get("mean").and_then(|v| v.as_f64()), Some(2.0));
    }

    #[test]
    fn test_file_source_reads_by_index() {
        use image::{ImageBuffer, Luma};

        let dir = tempfile::tempdir().unwrap();
        let img: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_pixel(3, 2, Luma([9]));
        img.save(dir.path().join("img_02.tif")).unwrap();

        let mut p = FileSource::create(
            FileSource::defaults()
                .with("directory", dir.path().display().to_string())
                .with("pattern", "img_{index:02}.tif")
                .with("first_index", 2i64),
        )
        .unwrap();
        p.pre_execute().unwrap();
        assert_eq!(p.calculate_result_shape(None).unwrap(), Shape::new(2, 3));
        let (out, side) = p.execute(Payload::Index(2), SideChannel::new()).unwrap();
        assert!(out.into_frame("t").unwrap().as_slice().iter().all(|&v| v == 9.0));
        assert!(side.get("path").is_some());
        assert!(p.execute(Payload::Index(3), SideChannel::new()).is_err());
    }

    #[test]
    fn test_register_builtins() {
        let registry = PluginRegistry::new();
        register_builtin_plugins(&registry);
        for (name, kind, ..) in builtins() {
            let plugin = registry.get_by_name(name).unwrap();
            assert_eq!(plugin.name(), name);
            assert_eq!(plugin.kind(), kind);
        }
    }
}
