//! Thumbnail Generator
//!
//! Captures the first decodable frame of a video as a JPEG still.

use crate::video_processor::{FrameReader, MediaError, OpenOptions};
use image::ImageFormat;
use log::debug;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ThumbnailError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("video has no decodable frames")]
    NoFrames,

    #[error("failed to write thumbnail: {0}")]
    Image(#[from] image::ImageError),
}

/// Decodes frame 0 of `source` and writes it to `dest` as a JPEG.
pub fn extract_thumbnail(
    source: &Path,
    dest: &Path,
    options: &OpenOptions,
) -> Result<(), ThumbnailError> {
    let mut reader = FrameReader::open(source, options)?;
    let frame = reader.next_frame()?.ok_or(ThumbnailError::NoFrames)?;
    frame.save_with_format(dest, ImageFormat::Jpeg)?;
    debug!("Wrote {}x{} thumbnail to {:?}", frame.width(), frame.height(), dest);
    Ok(())
}
