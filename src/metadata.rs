//! Metadata Extractor
//!
//! Derives duration, frame rate and resolution of a video from its container.

use crate::video_processor::{MediaError, OpenOptions, open_input, stream_info};
use ffmpeg::Packet;
use ffmpeg_next as ffmpeg;
use log::debug;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VideoMetadata {
    /// Seconds, rounded to two decimals.
    pub duration_sec: f64,
    /// Frames per second, rounded to two decimals.
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub frame_count: u64,
}

/// Rounds to two decimal places, the precision stored in records.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Reads metadata of the best video stream in `path`.
///
/// The frame count comes from the container when it records one; otherwise
/// the stream's packets are counted.
pub fn extract(path: &Path, options: &OpenOptions) -> Result<VideoMetadata, MediaError> {
    let mut ictx = open_input(path, options)?;
    let info = stream_info(&ictx, path)?;

    let frame_count = if info.frames > 0 {
        info.frames as u64
    } else {
        debug!("{:?} has no recorded frame count, counting packets", path);
        count_packets(&mut ictx, info.index, options)?
    };

    let fps = info.fps();
    let duration = if fps > 0.0 { frame_count as f64 / fps } else { 0.0 };

    Ok(VideoMetadata {
        duration_sec: round2(duration),
        fps: round2(fps),
        width: info.width,
        height: info.height,
        frame_count,
    })
}

fn count_packets(
    ictx: &mut ffmpeg::format::context::Input,
    stream_index: usize,
    options: &OpenOptions,
) -> Result<u64, MediaError> {
    let mut count = 0;
    let mut packet = Packet::empty();
    loop {
        match packet.read(ictx) {
            Ok(()) if packet.stream() == stream_index => count += 1,
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(count),
            Err(_) if options.cancel.is_canceled() => return Err(MediaError::Canceled),
            Err(source) => return Err(MediaError::Decode { context: "read packet", source }),
        }
    }
}
