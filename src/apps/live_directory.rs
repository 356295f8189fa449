//! Follow a directory that a detector writes frames into.
//!
//! Each cycle the newest complete file is located. When it differs from the
//! last one published, it is decoded, masked, background-corrected and
//! written to the shared frame buffer. A file that fails to decode is
//! replaced by the second-newest one for that cycle.
//!
//! Only one worker should run this app: several workers would race to
//! publish the same newest file.

use crate::config::{BufferConfig, resolve};
use crate::error::{Error, Result};
use crate::execution::{App, ItemResult, WorkItem};
use crate::files::{
    DetectorMask, FilenamePattern, FrameReader, IMAGE_EXTENSIONS, ImageFrameReader,
};
use crate::frame::{Frame, Shape};
use crate::memory::SharedFrameBuffer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// `[app]` section for `kind = "live_directory"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveDirectoryConfig {
    /// Directory the detector writes into.
    pub directory: PathBuf,
    /// Filename pattern with an `{index}` placeholder. Without one, the most
    /// recently modified image file is followed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Detector mask file; non-zero pixels are masked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<PathBuf>,
    /// Value written into masked pixels.
    #[serde(default)]
    pub mask_value: f32,
    /// Background frame subtracted from every published frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<PathBuf>,
}

impl LiveDirectoryConfig {
    /// Config following every image file in `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            pattern: None,
            mask: None,
            mask_value: 0.0,
            background: None,
        }
    }

    pub(crate) fn resolve_paths(&mut self, base: &Path) {
        resolve(&mut self.directory, base);
        if let Some(mask) = &mut self.mask {
            resolve(mask, base);
        }
        if let Some(background) = &mut self.background {
            resolve(background, base);
        }
    }
}

/// The newest file and its fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidates {
    newest: PathBuf,
    previous: Option<PathBuf>,
}

#[derive(Debug)]
enum Scan {
    Pattern { pattern: FilenamePattern, next: u64 },
    Newest,
}

/// Publishes the newest frame file into a [`SharedFrameBuffer`].
pub struct LiveDirectoryApp {
    config: LiveDirectoryConfig,
    capacity: Shape,
    reader: Arc<dyn FrameReader>,
    scan: Scan,
    mask: Option<DetectorMask>,
    background: Option<Frame>,
    buffer: Option<Arc<SharedFrameBuffer>>,
    item: WorkItem,
    last_seen: Option<PathBuf>,
    pending: Option<Candidates>,
    start_index: u64,
    latest: Option<(u64, Frame)>,
    published: u64,
    failed: u64,
}

impl LiveDirectoryApp {
    /// Controller-side app; allocates the frame buffer in
    /// [`prepare`](App::prepare).
    pub fn new(config: LiveDirectoryConfig, buffer: BufferConfig) -> Self {
        Self {
            config,
            capacity: Shape::new(buffer.max_height, buffer.max_width),
            reader: Arc::new(ImageFrameReader::new()),
            scan: Scan::Newest,
            mask: None,
            background: None,
            buffer: None,
            item: WorkItem::Idle,
            last_seen: None,
            pending: None,
            start_index: 0,
            latest: None,
            published: 0,
            failed: 0,
        }
    }

    /// Worker-side app publishing into a buffer received from the controller.
    pub fn with_buffer(config: LiveDirectoryConfig, buffer: Arc<SharedFrameBuffer>) -> Self {
        let capacity = buffer.capacity();
        let mut app = Self::new(
            config,
            BufferConfig {
                max_height: capacity.height,
                max_width: capacity.width,
            },
        );
        app.buffer = Some(buffer);
        app
    }

    /// Replace the frame decoder.
    pub fn with_reader(mut self, reader: Arc<dyn FrameReader>) -> Self {
        self.reader = reader;
        self
    }

    /// Most recent frame collected by [`store_result`](App::store_result),
    /// with its item index.
    pub fn latest_frame(&self) -> Option<&(u64, Frame)> {
        self.latest.as_ref()
    }

    /// Frames published so far.
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Cycles that failed.
    pub fn failed(&self) -> u64 {
        self.failed
    }

    fn find_candidates(&mut self) -> Result<Option<Candidates>> {
        let dir = &self.config.directory;
        match &mut self.scan {
            Scan::Pattern { pattern, next } => {
                while pattern.path(dir, *next + 1).exists() {
                    *next += 1;
                }
                let newest = pattern.path(dir, *next);
                if !newest.exists() {
                    return Ok(None);
                }
                let previous = next
                    .checked_sub(1)
                    .map(|i| pattern.path(dir, i))
                    .filter(|p| p.exists());
                Ok(Some(Candidates { newest, previous }))
            }
            Scan::Newest => {
                let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
                for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
                    let entry = entry.map_err(|e| {
                        Error::ResourceUnavailable(format!("cannot list {}: {e}", dir.display()))
                    })?;
                    if !entry.file_type().is_file() || !has_image_extension(entry.path()) {
                        continue;
                    }
                    // Files vanishing mid-scan are skipped.
                    let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
                    if let Some(modified) = modified {
                        files.push((modified, entry.into_path()));
                    }
                }
                files.sort();
                let mut newest_first = files.into_iter().rev().map(|(_, p)| p);
                Ok(newest_first.next().map(|newest| Candidates {
                    newest,
                    previous: newest_first.next(),
                }))
            }
        }
    }

    fn read_with_fallback(&self, candidates: &Candidates) -> Result<(Frame, PathBuf)> {
        match self.reader.read(&candidates.newest) {
            Ok(frame) => Ok((frame, candidates.newest.clone())),
            Err(first) => {
                warn!(
                    path = %candidates.newest.display(),
                    error = %first,
                    "Newest frame unreadable; falling back"
                );
                let previous = candidates.previous.as_ref().ok_or_else(|| {
                    Error::FatalIo(format!(
                        "{} unreadable and no earlier file: {first}",
                        candidates.newest.display()
                    ))
                })?;
                let frame = self.reader.read(previous).map_err(|second| {
                    Error::FatalIo(format!(
                        "{} and {} both unreadable: {first}; {second}",
                        candidates.newest.display(),
                        previous.display()
                    ))
                })?;
                Ok((frame, previous.clone()))
            }
        }
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// A zero-length file is still being created.
fn check_complete(path: &Path) -> Result<()> {
    let len = std::fs::metadata(path)
        .map_err(|e| Error::ResourceUnavailable(format!("{}: {e}", path.display())))?
        .len();
    if len == 0 {
        return Err(Error::ResourceUnavailable(format!(
            "{} is still empty",
            path.display()
        )));
    }
    Ok(())
}

impl App for LiveDirectoryApp {
    fn name(&self) -> &str {
        "live_directory"
    }

    fn prepare(&mut self) -> Result<()> {
        let dir = &self.config.directory;
        if !dir.is_dir() {
            return Err(Error::Config(format!(
                "watched directory {} does not exist",
                dir.display()
            )));
        }

        self.scan = match &self.config.pattern {
            Some(text) => {
                let pattern = FilenamePattern::parse(text)?;
                let next = pattern.highest_existing(dir)?.unwrap_or(0);
                self.start_index = next;
                Scan::Pattern { pattern, next }
            }
            None => Scan::Newest,
        };

        if let Some(path) = &self.config.mask {
            let mask = DetectorMask::load(self.reader.as_ref(), path, self.config.mask_value)?;
            info!(masked = mask.masked_count(), shape = %mask.shape(), "Loaded detector mask");
            self.mask = Some(mask);
        }

        if let Some(path) = &self.config.background {
            let mut background = self.reader.read(path).map_err(|e| {
                Error::Config(format!("cannot load background {}: {e}", path.display()))
            })?;
            if let Some(mask) = &self.mask {
                mask.apply(&mut background)?;
            }
            info!(shape = %background.shape(), "Loaded background frame");
            self.background = Some(background);
        }

        if self.buffer.is_none() {
            let buffer = SharedFrameBuffer::new(self.capacity.height, self.capacity.width)?;
            info!(capacity = %self.capacity, bytes = buffer.region_len(), "Allocated frame buffer");
            self.buffer = Some(Arc::new(buffer));
        }

        info!(
            dir = %self.config.directory.display(),
            pattern = self.config.pattern.as_deref().unwrap_or("<newest>"),
            "Watching directory"
        );
        Ok(())
    }

    fn pre_cycle(&mut self, item: WorkItem) {
        self.item = item;
    }

    fn carry_on(&mut self) -> bool {
        if !matches!(self.item, WorkItem::Index(_)) {
            return false;
        }
        let candidates = match self.find_candidates() {
            Ok(Some(c)) => c,
            Ok(None) => return false,
            Err(e) => {
                debug!(error = %e, "Directory scan failed");
                return false;
            }
        };
        if self.last_seen.as_ref() == Some(&candidates.newest) {
            return false;
        }
        if let Err(e) = check_complete(&candidates.newest) {
            debug!(error = %e, "Newest file not ready");
            return false;
        }
        debug!(path = %candidates.newest.display(), "New frame file");
        self.last_seen = Some(candidates.newest.clone());
        self.pending = Some(candidates);
        true
    }

    fn compute(&mut self, _index: u64) -> Result<ItemResult> {
        let candidates = self
            .pending
            .take()
            .ok_or_else(|| Error::FatalIo("compute called without a new file".into()))?;
        let (mut frame, source) = match self.read_with_fallback(&candidates) {
            Ok(read) => read,
            Err(e) => {
                // Reopen the gate so the next poll retries the same file.
                self.last_seen = None;
                return Err(e);
            }
        };
        if let Some(mask) = &self.mask {
            mask.apply(&mut frame)?;
        }
        if let Some(background) = &self.background {
            frame.subtract(background)?;
        }
        let buffer = self
            .buffer
            .as_ref()
            .ok_or_else(|| Error::Config("frame buffer not allocated".into()))?;
        buffer.lock().write_frame(&frame)?;
        Ok(ItemResult::Published {
            shape: frame.shape(),
            source: source.display().to_string(),
        })
    }

    fn store_result(&mut self, index: u64, result: ItemResult) -> Result<()> {
        match result {
            ItemResult::Published { shape, source } => {
                let buffer = self
                    .buffer
                    .as_ref()
                    .ok_or_else(|| Error::Config("frame buffer not allocated".into()))?;
                self.latest = Some((index, buffer.snapshot()));
                self.published += 1;
                info!(index, %shape, %source, "Frame published");
            }
            ItemResult::Failed { message } => {
                self.failed += 1;
                warn!(index, %message, "Cycle failed");
            }
            ItemResult::Frames(_) => {
                return Err(Error::Protocol(format!(
                    "item {index}: live directory workers publish through the buffer"
                )));
            }
        }
        Ok(())
    }

    fn start_index(&self) -> u64 {
        self.start_index
    }

    fn shared_buffer(&self) -> Option<Arc<SharedFrameBuffer>> {
        self.buffer.clone()
    }
}
