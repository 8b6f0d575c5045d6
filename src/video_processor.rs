//! Video Processing Module
//!
//! Handles decoding of video files into RGB frames and encoding RGB frames
//! back into an MP4 container, using the ffmpeg-next crate.

use crate::progress::CancelToken;
use ffmpeg::codec;
use ffmpeg::format::{self, Pixel};
use ffmpeg::media::Type;
use ffmpeg::software::scaling::{Context as ScalingContext, flag::Flags};
use ffmpeg::util::frame::video::Video;
use ffmpeg::{Packet, Rational};
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default bound on how long opening an input may take.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bit rate used when the encoder is not libx264 (which runs in CRF mode).
const FALLBACK_BIT_RATE: usize = 4_000_000;

/// Encoders tried in order when creating an output.
const ENCODER_CANDIDATES: [&str; 3] = ["libx264", "libopenh264", "mpeg4"];

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: ffmpeg::Error,
    },

    #[error("no decodable video stream in {0}")]
    NoVideoStream(PathBuf),

    #[error("opening {path} timed out after {timeout:?}")]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("canceled")]
    Canceled,

    #[error("decode error: {context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: ffmpeg::Error,
    },

    #[error("encode error: {context}: {source}")]
    Encode {
        context: &'static str,
        #[source]
        source: ffmpeg::Error,
    },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("none of libx264, libopenh264 or mpeg4 is available in the linked FFmpeg")]
    NoEncoder,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MediaError {
    /// Errors raised before a single frame could be decoded.
    pub fn is_open_failure(&self) -> bool {
        matches!(
            self,
            MediaError::Open { .. } | MediaError::NoVideoStream(_) | MediaError::Timeout { .. }
        )
    }
}

/// Options applied whenever an input is opened.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub timeout: Duration,
    pub cancel: CancelToken,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_OPEN_TIMEOUT,
            cancel: CancelToken::new(),
        }
    }
}

/// Basic properties of the best video stream in a container.
#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    /// Frame count as recorded by the container, zero if absent.
    pub frames: i64,
    /// Container duration in microseconds, zero if absent.
    pub duration_us: i64,
}

impl StreamInfo {
    pub fn fps(&self) -> f64 {
        if self.frame_rate.0 > 0 && self.frame_rate.1 > 0 {
            self.frame_rate.0 as f64 / self.frame_rate.1 as f64
        } else {
            0.0
        }
    }
}

/// Opens an input container. The interrupt callback aborts the open once
/// `timeout` elapses and aborts any later read once the token is canceled.
pub fn open_input(path: &Path, options: &OpenOptions) -> Result<format::context::Input, MediaError> {
    ffmpeg::init().map_err(|source| MediaError::Open { path: path.to_path_buf(), source })?;

    let deadline = Instant::now() + options.timeout;
    let opened = Arc::new(AtomicBool::new(false));
    let timed_out = Arc::new(AtomicBool::new(false));
    let interrupt = {
        let opened = Arc::clone(&opened);
        let timed_out = Arc::clone(&timed_out);
        let cancel = options.cancel.clone();
        move || {
            if cancel.is_canceled() {
                return true;
            }
            if !opened.load(Ordering::Relaxed) && Instant::now() >= deadline {
                timed_out.store(true, Ordering::Relaxed);
                return true;
            }
            false
        }
    };

    match format::input_with_interrupt(path, interrupt) {
        Ok(ictx) => {
            opened.store(true, Ordering::Relaxed);
            Ok(ictx)
        }
        Err(_) if options.cancel.is_canceled() => Err(MediaError::Canceled),
        Err(_) if timed_out.load(Ordering::Relaxed) => Err(MediaError::Timeout {
            path: path.to_path_buf(),
            timeout: options.timeout,
        }),
        Err(source) => Err(MediaError::Open { path: path.to_path_buf(), source }),
    }
}

/// Reads the best video stream's properties from an opened container.
pub fn stream_info(ictx: &format::context::Input, path: &Path) -> Result<StreamInfo, MediaError> {
    let stream = ictx
        .streams()
        .best(Type::Video)
        .ok_or_else(|| MediaError::NoVideoStream(path.to_path_buf()))?;

    let decoder = codec::context::Context::from_parameters(stream.parameters())
        .and_then(|ctx| ctx.decoder().video())
        .map_err(|_| MediaError::NoVideoStream(path.to_path_buf()))?;

    let mut frame_rate = stream.avg_frame_rate();
    if frame_rate.0 <= 0 || frame_rate.1 <= 0 {
        frame_rate = stream.rate();
    }

    Ok(StreamInfo {
        index: stream.index(),
        width: decoder.width(),
        height: decoder.height(),
        frame_rate,
        frames: stream.frames(),
        duration_us: ictx.duration().max(0),
    })
}

/// Total number of frames according to container metadata: the stream's
/// frame count, else duration times frame rate, else zero.
///
/// This is much faster than decoding the whole video, but the result can be
/// an estimate for variable frame rate (VFR) videos.
pub fn estimate_frames(info: &StreamInfo) -> u64 {
    if info.frames > 0 {
        return info.frames as u64;
    }
    // Duration is in AV_TIME_BASE units (microseconds)
    let fps = info.fps();
    if info.duration_us > 0 && fps > 0.0 {
        let duration_secs = info.duration_us as f64 / 1_000_000.0;
        return (duration_secs * fps).round() as u64;
    }
    0
}

/// Sequential RGB frame source over one video stream.
pub struct FrameReader {
    input: format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: Option<ScalingContext>,
    info: StreamInfo,
    cancel: CancelToken,
    eof_sent: bool,
    frames_read: u64,
}

impl FrameReader {
    pub fn open(path: &Path, options: &OpenOptions) -> Result<Self, MediaError> {
        let input = open_input(path, options)?;
        let info = stream_info(&input, path)?;

        let stream = input
            .stream(info.index)
            .ok_or_else(|| MediaError::NoVideoStream(path.to_path_buf()))?;
        let decoder = codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video())
            .map_err(|_| MediaError::NoVideoStream(path.to_path_buf()))?;

        if info.width == 0 || info.height == 0 {
            return Err(MediaError::NoVideoStream(path.to_path_buf()));
        }

        Ok(Self {
            input,
            decoder,
            scaler: None,
            info,
            cancel: options.cancel.clone(),
            eof_sent: false,
            frames_read: 0,
        })
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Decodes the next frame in presentation order, or `None` at end of stream.
    pub fn next_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        let mut decoded = Video::empty();
        loop {
            if self.cancel.is_canceled() {
                return Err(MediaError::Canceled);
            }
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let image = self.to_rgb(&decoded)?;
                self.frames_read += 1;
                return Ok(Some(image));
            }
            if self.eof_sent {
                return Ok(None);
            }

            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() == self.info.index {
                        self.decoder
                            .send_packet(&packet)
                            .map_err(|source| MediaError::Decode {
                                context: "send packet to decoder",
                                source,
                            })?;
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().map_err(|source| MediaError::Decode {
                        context: "flush decoder",
                        source,
                    })?;
                    self.eof_sent = true;
                }
                Err(_) if self.cancel.is_canceled() => return Err(MediaError::Canceled),
                Err(source) => {
                    return Err(MediaError::Decode { context: "read packet", source });
                }
            }
        }
    }

    fn to_rgb(&mut self, decoded: &Video) -> Result<RgbImage, MediaError> {
        let (width, height) = (self.info.width, self.info.height);
        if self.scaler.is_none() {
            let scaler = ScalingContext::get(
                decoded.format(),
                decoded.width(),
                decoded.height(),
                Pixel::RGB24,
                width,
                height,
                Flags::BILINEAR,
            )
            .map_err(|source| MediaError::Decode { context: "create scaler", source })?;
            self.scaler = Some(scaler);
        }
        let Some(scaler) = self.scaler.as_mut() else {
            return Err(MediaError::InvalidFrame("scaler unavailable".into()));
        };

        let mut rgb_frame = Video::empty();
        scaler
            .run(decoded, &mut rgb_frame)
            .map_err(|source| MediaError::Decode { context: "scale frame", source })?;

        let frame_data = rgb_frame.data(0);
        let stride = rgb_frame.stride(0);
        let row_len = width as usize * 3;
        if stride < row_len {
            return Err(MediaError::InvalidFrame("invalid frame stride".into()));
        }

        let mut buffer = Vec::with_capacity(row_len * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            let end = start + row_len;
            if end > frame_data.len() {
                return Err(MediaError::InvalidFrame("frame data is smaller than expected".into()));
            }
            buffer.extend_from_slice(&frame_data[start..end]);
        }

        RgbImage::from_vec(width, height, buffer)
            .ok_or_else(|| MediaError::InvalidFrame("failed to build image buffer".into()))
    }
}

/// Encodes RGB frames into an MP4 file (H.264 via libx264 or libopenh264
/// when they accept the frame size, MPEG-4 Part 2 otherwise) at a constant
/// frame rate.
pub struct VideoWriter {
    output: format::context::Output,
    encoder: ffmpeg::encoder::Video,
    scaler: ScalingContext,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
    width: u32,
    height: u32,
    frames_written: u64,
}

impl VideoWriter {
    pub fn create(
        path: &Path,
        width: u32,
        height: u32,
        frame_rate: Rational,
    ) -> Result<Self, MediaError> {
        ffmpeg::init().map_err(|source| MediaError::Encode { context: "initialize FFmpeg", source })?;
        if width == 0 || height == 0 || frame_rate.0 <= 0 || frame_rate.1 <= 0 {
            return Err(MediaError::InvalidFrame(format!(
                "cannot encode {}x{} at {}/{} fps",
                width, height, frame_rate.0, frame_rate.1
            )));
        }

        let mut output = format::output_as(path, "mp4").map_err(|source| MediaError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let global_header = output.format().flags().contains(format::flag::Flags::GLOBAL_HEADER);
        let encoder_time_base = frame_rate.invert();

        let (codec, encoder) = open_encoder(width, height, frame_rate, global_header)?;
        let stream_index = {
            let mut ost = output
                .add_stream(codec)
                .map_err(|source| MediaError::Encode { context: "add output stream", source })?;
            ost.set_parameters(&encoder);
            ost.index()
        };

        output
            .write_header()
            .map_err(|source| MediaError::Encode { context: "write header", source })?;
        let stream_time_base = output
            .stream(stream_index)
            .map(|s| s.time_base())
            .unwrap_or(encoder_time_base);

        let scaler = ScalingContext::get(
            Pixel::RGB24,
            width,
            height,
            Pixel::YUV420P,
            width,
            height,
            Flags::BILINEAR,
        )
        .map_err(|source| MediaError::Encode { context: "create scaler", source })?;

        debug!(
            "Opened encoder {} for {:?}: {}x{} @ {}/{}",
            codec.name(),
            path,
            width,
            height,
            frame_rate.0,
            frame_rate.1
        );

        Ok(Self {
            output,
            encoder,
            scaler,
            stream_index,
            encoder_time_base,
            stream_time_base,
            width,
            height,
            frames_written: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Appends one frame. The frame must match the writer's dimensions.
    pub fn write_frame(&mut self, image: &RgbImage) -> Result<(), MediaError> {
        if image.dimensions() != (self.width, self.height) {
            return Err(MediaError::InvalidFrame(format!(
                "frame is {}x{}, encoder expects {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height
            )));
        }

        let mut rgb_frame = Video::new(Pixel::RGB24, self.width, self.height);
        let stride = rgb_frame.stride(0);
        let row_len = self.width as usize * 3;
        let data = rgb_frame.data_mut(0);
        for (y, row) in image.as_raw().chunks_exact(row_len).enumerate() {
            data[y * stride..y * stride + row_len].copy_from_slice(row);
        }

        let mut yuv_frame = Video::empty();
        self.scaler
            .run(&rgb_frame, &mut yuv_frame)
            .map_err(|source| MediaError::Encode { context: "scale frame", source })?;
        yuv_frame.set_pts(Some(self.frames_written as i64));

        self.encoder
            .send_frame(&yuv_frame)
            .map_err(|source| MediaError::Encode { context: "send frame to encoder", source })?;
        self.write_packets()?;
        self.frames_written += 1;
        Ok(())
    }

    /// Flushes the encoder and writes the container trailer.
    pub fn finish(mut self) -> Result<u64, MediaError> {
        self.encoder
            .send_eof()
            .map_err(|source| MediaError::Encode { context: "flush encoder", source })?;
        self.write_packets()?;
        self.output
            .write_trailer()
            .map_err(|source| MediaError::Encode { context: "write trailer", source })?;
        Ok(self.frames_written)
    }

    fn write_packets(&mut self) -> Result<(), MediaError> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .map_err(|source| MediaError::Encode { context: "write packet", source })?;
        }
        Ok(())
    }
}

/// Opens the first encoder in `ENCODER_CANDIDATES` that is linked in and
/// accepts the frame size. libx264 rejects odd dimensions, hardware-backed
/// builds fail to open without their device; both fall through.
fn open_encoder(
    width: u32,
    height: u32,
    frame_rate: Rational,
    global_header: bool,
) -> Result<(ffmpeg::Codec, ffmpeg::encoder::Video), MediaError> {
    let mut last_error = None;
    for name in ENCODER_CANDIDATES {
        let Some(codec) = ffmpeg::encoder::find_by_name(name) else {
            continue;
        };

        let mut encoder = match codec::context::Context::new_with_codec(codec).encoder().video() {
            Ok(encoder) => encoder,
            Err(e) => {
                warn!("Encoder {} unavailable: {}", name, e);
                last_error = Some(e);
                continue;
            }
        };
        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(frame_rate.invert());
        encoder.set_frame_rate(Some(frame_rate));
        if global_header {
            encoder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }

        let mut opts = ffmpeg::Dictionary::new();
        if name == "libx264" {
            opts.set("preset", "medium");
            opts.set("crf", "23");
        } else {
            encoder.set_bit_rate(FALLBACK_BIT_RATE);
        }

        match encoder.open_with(opts) {
            Ok(encoder) => return Ok((codec, encoder)),
            Err(e) => {
                warn!("Encoder {} rejected {}x{}: {}", name, width, height, e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(source) => Err(MediaError::Encode { context: "open encoder", source }),
        None => Err(MediaError::NoEncoder),
    }
}
