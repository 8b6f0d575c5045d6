mod common;

use common::{FPS, FRAMES, HEIGHT, WIDTH, decode_all, write_sample_video};
use vidpipe::FilterRegistry;
use vidpipe::metadata;
use vidpipe::transcoder::transcode;
use ffmpeg_next::Rational;
use image::{Rgb, RgbImage};
use vidpipe::video_processor::{FrameReader, MediaError, OpenOptions, VideoWriter, estimate_frames};

#[test]
fn every_filter_keeps_frame_count_size_and_rate() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.mp4");
    write_sample_video(&source);

    let registry = FilterRegistry::standard();
    for name in registry.names() {
        let dest = dir.path().join(format!("{name}.mp4"));
        let filter = registry.resolve(name).unwrap();
        let report = transcode(&source, &dest, filter.as_ref(), &OpenOptions::default(), None).unwrap();

        assert_eq!(report.frames_written, FRAMES, "{name}");
        assert_eq!((report.width, report.height), (WIDTH, HEIGHT), "{name}");

        let frames = decode_all(&dest);
        assert_eq!(frames.len() as u64, FRAMES, "{name}");
        assert!(frames.iter().all(|f| f.dimensions() == (WIDTH, HEIGHT)), "{name}");

        let meta = metadata::extract(&dest, &OpenOptions::default()).unwrap();
        assert!((meta.fps - FPS as f64).abs() < 0.01, "{name}: fps {}", meta.fps);
        assert!(!dest.with_extension("mp4.partial").exists());
    }
}

#[test]
fn metadata_of_sample_clip() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.mp4");
    write_sample_video(&source);

    let meta = metadata::extract(&source, &OpenOptions::default()).unwrap();
    assert_eq!((meta.width, meta.height), (WIDTH, HEIGHT));
    assert_eq!(meta.frame_count, FRAMES);
    assert!((meta.duration_sec - 2.0).abs() < 0.15, "duration {}", meta.duration_sec);
    let reader = FrameReader::open(&source, &OpenOptions::default()).unwrap();
    assert_eq!(estimate_frames(reader.info()), FRAMES);
}

#[test]
fn canceled_open_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.mp4");
    write_sample_video(&source);

    let options = OpenOptions::default();
    options.cancel.cancel();
    let dest = dir.path().join("out.mp4");
    let registry = FilterRegistry::standard();
    let filter = registry.resolve("invert").unwrap();

    let result = transcode(&source, &dest, filter.as_ref(), &options, None);
    assert!(matches!(result, Err(MediaError::Canceled)), "got {result:?}");
    assert!(!dest.exists());
}

#[test]
fn odd_dimensions_fall_back_to_an_encoder_that_accepts_them() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("odd.mp4");

    let mut writer = VideoWriter::create(&source, 65, 49, Rational(FPS, 1)).unwrap();
    for i in 0..5u8 {
        let frame = RgbImage::from_fn(65, 49, |x, y| Rgb([x as u8 * 3, y as u8 * 5, i * 40]));
        writer.write_frame(&frame).unwrap();
    }
    assert_eq!(writer.finish().unwrap(), 5);

    let frames = decode_all(&source);
    assert_eq!(frames.len(), 5);
    assert!(frames.iter().all(|f| f.dimensions() == (65, 49)));

    let dest = dir.path().join("odd_gray.mp4");
    let registry = FilterRegistry::standard();
    let filter = registry.resolve("grayscale").unwrap();
    let report = transcode(&source, &dest, filter.as_ref(), &OpenOptions::default(), None).unwrap();
    assert_eq!((report.width, report.height, report.frames_written), (65, 49, 5));
}
