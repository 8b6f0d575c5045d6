//! Frame Pipeline
//!
//! Decodes a source video frame by frame, runs each frame through a filter
//! and re-encodes the result at the source's frame rate and size.

use crate::filters::FrameFilter;
use crate::progress::IngestProgress;
use crate::video_processor::{
    FrameReader, MediaError, OpenOptions, VideoWriter, estimate_frames,
};
use ffmpeg_next::Rational;
use log::{info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Used when the container does not report a usable frame rate.
const FALLBACK_FRAME_RATE: Rational = Rational(25, 1);

#[derive(Debug, Clone, Copy)]
pub struct TranscodeReport {
    pub frames_written: u64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
}

/// Transcodes `source` into `dest`, applying `filter` to every frame in order.
///
/// Output goes to a `.partial` sibling that is renamed onto `dest` only after
/// the container trailer is written, so `dest` never holds a partial file.
/// If the source cannot be opened nothing is written at all.
pub fn transcode(
    source: &Path,
    dest: &Path,
    filter: &dyn FrameFilter,
    options: &OpenOptions,
    progress: Option<&IngestProgress>,
) -> Result<TranscodeReport, MediaError> {
    let mut reader = FrameReader::open(source, options)?;
    let stream = *reader.info();

    let frame_rate = if stream.fps() > 0.0 {
        stream.frame_rate
    } else {
        warn!("{:?} reports no frame rate, encoding at 25 fps", source);
        FALLBACK_FRAME_RATE
    };
    if let Some(progress) = progress {
        progress.set_total(estimate_frames(&stream));
    }

    let partial = partial_path(dest);
    let result = encode_all(&mut reader, &partial, frame_rate, filter, progress)
        .and_then(|frames| {
            fs::rename(&partial, dest)
                .map(|_| frames)
                .map_err(|source| MediaError::Io { path: dest.to_path_buf(), source })
        });

    match result {
        Ok(frames_written) => {
            info!(
                "Transcoded {} frames ({}x{}) from {:?} to {:?}",
                frames_written, stream.width, stream.height, source, dest
            );
            Ok(TranscodeReport {
                frames_written,
                width: stream.width,
                height: stream.height,
                frame_rate,
            })
        }
        Err(err) => {
            remove_if_present(&partial);
            remove_if_present(dest);
            Err(err)
        }
    }
}

fn encode_all(
    reader: &mut FrameReader,
    partial: &Path,
    frame_rate: Rational,
    filter: &dyn FrameFilter,
    progress: Option<&IngestProgress>,
) -> Result<u64, MediaError> {
    let (width, height) = (reader.info().width, reader.info().height);
    let mut writer = VideoWriter::create(partial, width, height, frame_rate)?;

    while let Some(frame) = reader.next_frame()? {
        let filtered = filter.apply(&frame);
        if filtered.dimensions() != (width, height) {
            let (w, h) = filtered.dimensions();
            return Err(MediaError::InvalidFrame(format!(
                "filter changed frame size from {}x{} to {}x{}",
                width, height, w, h
            )));
        }
        writer.write_frame(&filtered.into_rgb())?;
        if let Some(progress) = progress {
            progress.frame_written();
        }
    }

    writer.finish()
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!("Removed partial output {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove partial output {:?}: {}", path, e),
    }
}
