//! Live directory app against real TIFF files.

use frameflow::apps::{LiveDirectoryApp, LiveDirectoryConfig};
use frameflow::config::{BufferConfig, RunConfig};
use frameflow::execution::{App, ItemResult, Runner, WorkItem};
use frameflow::frame::Shape;
use image::{ImageBuffer, Luma};
use std::path::Path;

fn write_tiff(path: &Path, width: u32, height: u32, value: u16) {
    let img: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_pixel(width, height, Luma([value]));
    img.save(path).unwrap();
}

fn frame_path(dir: &Path, index: u64) -> std::path::PathBuf {
    dir.join(format!("frame_{index:04}.tif"))
}

fn seeded_dir(count: u64) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..count {
        write_tiff(&frame_path(dir.path(), i), 8, 6, i as u16);
    }
    dir
}

fn pattern_app(dir: &Path) -> LiveDirectoryApp {
    let mut config = LiveDirectoryConfig::new(dir);
    config.pattern = Some("frame_{index:04}.tif".into());
    LiveDirectoryApp::new(
        config,
        BufferConfig {
            max_height: 16,
            max_width: 16,
        },
    )
}

fn source_of(result: &ItemResult) -> &str {
    match result {
        ItemResult::Published { source, .. } => source,
        other => panic!("expected a published frame, got {other:?}"),
    }
}

// ============================================================================
// Gate
// ============================================================================

/// The gate opens once for the existing latest file, then once per new file.
#[test]
fn test_gate_opens_once_per_new_file() {
    let dir = seeded_dir(10);
    let mut app = pattern_app(dir.path());
    app.prepare().unwrap();
    assert_eq!(app.start_index(), 9);

    app.pre_cycle(WorkItem::Index(9));
    assert!(app.carry_on());
    let result = app.compute(9).unwrap();
    assert!(source_of(&result).ends_with("frame_0009.tif"));
    for _ in 0..3 {
        assert!(!app.carry_on());
    }

    write_tiff(&frame_path(dir.path(), 10), 8, 6, 10);
    write_tiff(&frame_path(dir.path(), 11), 8, 6, 11);
    assert!(app.carry_on());
    let result = app.compute(10).unwrap();
    assert!(source_of(&result).ends_with("frame_0011.tif"));
    assert!(!app.carry_on());
}

#[test]
fn test_gate_follows_modification_time_without_pattern() {
    let dir = tempfile::tempdir().unwrap();
    write_tiff(&dir.path().join("b.tif"), 4, 4, 1);
    std::thread::sleep(std::time::Duration::from_millis(20));
    write_tiff(&dir.path().join("a.tif"), 4, 4, 2);
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let mut app = LiveDirectoryApp::new(
        LiveDirectoryConfig::new(dir.path()),
        BufferConfig {
            max_height: 8,
            max_width: 8,
        },
    );
    app.prepare().unwrap();
    app.pre_cycle(WorkItem::Index(0));
    assert!(app.carry_on());
    let result = app.compute(0).unwrap();
    assert!(source_of(&result).ends_with("a.tif"));
    assert!(!app.carry_on());
}

// ============================================================================
// Fallback and publication
// ============================================================================

/// A corrupt newest file is replaced by the one before it.
#[test]
fn test_corrupt_latest_falls_back() {
    let dir = seeded_dir(10);
    std::fs::write(frame_path(dir.path(), 10), b"II*\0garbage").unwrap();

    let mut app = pattern_app(dir.path());
    app.prepare().unwrap();
    app.pre_cycle(WorkItem::Index(10));
    assert!(app.carry_on());
    let result = app.compute(10).unwrap();
    assert!(source_of(&result).ends_with("frame_0009.tif"));

    app.store_result(10, result).unwrap();
    let (index, frame) = app.latest_frame().unwrap();
    assert_eq!(*index, 10);
    assert_eq!(frame.shape(), Shape::new(6, 8));
    assert!(frame.as_slice().iter().all(|&v| v == 9.0));
}

#[test]
fn test_mask_and_background_applied() {
    let dir = seeded_dir(1);
    write_tiff(&frame_path(dir.path(), 1), 8, 6, 50);

    let mut mask: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::new(8, 6);
    mask.put_pixel(0, 0, Luma([1]));
    mask.save(dir.path().join("mask.png")).unwrap();
    write_tiff(&dir.path().join("background.png"), 8, 6, 20);

    let mut config = LiveDirectoryConfig::new(dir.path());
    config.pattern = Some("frame_{index:04}.tif".into());
    config.mask = Some(dir.path().join("mask.png"));
    config.mask_value = -1.0;
    config.background = Some(dir.path().join("background.png"));
    let mut app = LiveDirectoryApp::new(
        config,
        BufferConfig {
            max_height: 16,
            max_width: 16,
        },
    );
    app.prepare().unwrap();

    app.pre_cycle(WorkItem::Index(1));
    assert!(app.carry_on());
    let result = app.compute(1).unwrap();
    app.store_result(1, result).unwrap();

    let (_, frame) = app.latest_frame().unwrap();
    // Masked in both frame and background: -1 - -1.
    assert_eq!(frame.get(0, 0), Some(0.0));
    assert_eq!(frame.get(5, 7), Some(30.0));
}

#[test]
fn test_frame_larger_than_buffer_fails_cycle() {
    let dir = tempfile::tempdir().unwrap();
    write_tiff(&frame_path(dir.path(), 0), 32, 32, 1);
    let mut app = pattern_app(dir.path());
    app.prepare().unwrap();
    app.pre_cycle(WorkItem::Index(0));
    assert!(app.carry_on());
    let err = app.compute(0).unwrap_err();
    assert!(!err.terminates_run());
}

// ============================================================================
// Full run
// ============================================================================

#[test]
fn test_runner_publishes_latest_frame_thread_mode() {
    let dir = seeded_dir(4);
    let config = RunConfig::from_toml_str(&format!(
        r#"
        [pool]
        workers = 1
        mode = "thread"
        poll_interval_ms = 1
        input_timeout_ms = 5

        [buffer]
        max_height = 32
        max_width = 32

        [app]
        kind = "live_directory"
        directory = "{}"
        pattern = "frame_{{index:04}}.tif"
        "#,
        dir.path().display()
    ))
    .unwrap();

    let (app, summary) = Runner::new(config).run(Some(1)).unwrap();
    assert_eq!(summary.completed, 1);
    let frame = app.shared_buffer().unwrap().snapshot();
    assert_eq!(frame.shape(), Shape::new(6, 8));
    assert!(frame.as_slice().iter().all(|&v| v == 3.0));
}
