#![allow(dead_code)]

use ffmpeg_next::Rational;
use image::{Rgb, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use vidpipe::video_processor::{FrameReader, OpenOptions, VideoWriter};
use vidpipe::{FilterRegistry, Ingestor, MetadataStore, PipelineOptions, SqliteStore, StorageLayout};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;
pub const FPS: i32 = 10;
pub const FRAMES: u64 = 20;

/// Writes a colourful 64x48, 10 fps, 20 frame clip.
pub fn write_sample_video(path: &Path) {
    let mut writer = VideoWriter::create(path, WIDTH, HEIGHT, Rational(FPS, 1)).unwrap();
    for i in 0..FRAMES as u32 {
        let frame = RgbImage::from_fn(WIDTH, HEIGHT, |x, y| {
            Rgb([
                (x * 4 + i * 3) as u8,
                (y * 5) as u8,
                if (x / 8 + y / 8 + i) % 2 == 0 { 220 } else { 30 },
            ])
        });
        writer.write_frame(&frame).unwrap();
    }
    assert_eq!(writer.finish().unwrap(), FRAMES);
}

/// Decodes every frame of `path`.
pub fn decode_all(path: &Path) -> Vec<RgbImage> {
    let mut reader = FrameReader::open(path, &OpenOptions::default()).unwrap();
    let mut frames = Vec::new();
    while let Some(frame) = reader.next_frame().unwrap() {
        frames.push(frame);
    }
    frames
}

/// Every file and directory under `root`, relative and sorted.
pub fn snapshot(root: &Path) -> Vec<PathBuf> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            out.push(path.strip_prefix(root).unwrap().to_path_buf());
            if path.is_dir() {
                walk(root, &path, out);
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

pub struct Fixture {
    pub dir: TempDir,
    pub root: PathBuf,
    pub sample: PathBuf,
    pub store: Arc<SqliteStore>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("media");
        let sample = dir.path().join("sample.mp4");
        write_sample_video(&sample);
        Self {
            dir,
            root,
            sample,
            store: Arc::new(SqliteStore::open_in_memory().unwrap()),
        }
    }

    pub fn ingestor(&self) -> Ingestor {
        self.ingestor_with(FilterRegistry::standard(), self.store.clone())
    }

    pub fn ingestor_with(&self, filters: FilterRegistry, store: Arc<dyn MetadataStore>) -> Ingestor {
        Ingestor::new(
            StorageLayout::open(&self.root).unwrap(),
            Arc::new(filters),
            store,
            PipelineOptions::default(),
        )
    }

    pub fn sample_bytes(&self) -> Vec<u8> {
        fs::read(&self.sample).unwrap()
    }
}
