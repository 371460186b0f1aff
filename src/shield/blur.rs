//! Gaussian blur and JPEG codec helpers for video frames

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ColorType, ImageEncoder, RgbImage};

use crate::frame::VideoFrame;
use crate::shield::detector::Region;

fn to_image(frame: &VideoFrame) -> Result<RgbImage> {
    RgbImage::from_raw(frame.width, frame.height, frame.pixels.to_vec())
        .ok_or_else(|| anyhow!("pixel buffer does not match {}x{}", frame.width, frame.height))
}

fn from_image(img: RgbImage, timestamp_us: u64) -> VideoFrame {
    let (width, height) = img.dimensions();
    VideoFrame {
        pixels: Bytes::from(img.into_raw()),
        width,
        height,
        timestamp_us,
    }
}

/// Blur the entire frame.
pub fn blur_full(frame: &VideoFrame, sigma: f32) -> Result<VideoFrame> {
    let img = to_image(frame)?;
    let blurred = imageops::blur(&img, sigma);
    Ok(from_image(blurred, frame.timestamp_us))
}

/// Blur only the given regions, leaving the rest of the frame untouched.
///
/// Regions are clamped to the frame bounds; regions that fall entirely
/// outside the frame are skipped.
pub fn blur_regions(frame: &VideoFrame, regions: &[Region], sigma: f32) -> Result<VideoFrame> {
    let mut img = to_image(frame)?;
    for region in regions {
        let Some((x, y, w, h)) = clamp_region(region, frame.width, frame.height) else {
            continue;
        };
        let patch = imageops::crop_imm(&img, x, y, w, h).to_image();
        let blurred = imageops::blur(&patch, sigma);
        imageops::replace(&mut img, &blurred, x as i64, y as i64);
    }
    Ok(from_image(img, frame.timestamp_us))
}

fn clamp_region(region: &Region, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    if region.x >= width || region.y >= height {
        return None;
    }
    let w = region.width.min(width - region.x);
    let h = region.height.min(height - region.y);
    if w == 0 || h == 0 {
        return None;
    }
    Some((region.x, region.y, w, h))
}

/// Encode a frame as JPEG at the given quality.
pub fn encode_jpeg(frame: &VideoFrame, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder
        .write_image(&frame.pixels, frame.width, frame.height, ColorType::Rgb8)
        .context("jpeg encode failed")?;
    Ok(buf)
}

/// Decode a JPEG (or any supported image) into an RGB8 frame.
pub fn decode_image(bytes: &[u8], timestamp_us: u64) -> Result<VideoFrame> {
    let img = image::load_from_memory(bytes)
        .context("image decode failed")?
        .to_rgb8();
    Ok(from_image(img, timestamp_us))
}

/// Mean absolute per-channel difference between two frames of equal size.
/// Used by tests and the snapshot review path to confirm a blur landed.
pub fn mean_abs_diff(a: &VideoFrame, b: &VideoFrame) -> f64 {
    if a.pixels.len() != b.pixels.len() || a.pixels.is_empty() {
        return f64::MAX;
    }
    let total: u64 = a
        .pixels
        .iter()
        .zip(b.pixels.iter())
        .map(|(&x, &y)| x.abs_diff(y) as u64)
        .sum();
    total as f64 / a.pixels.len() as f64
}
