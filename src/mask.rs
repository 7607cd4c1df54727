//! Pixel-level preprocessing for inpainting masks and character references.
//!
//! Everything here is synchronous and pure: bytes in, PNG bytes out.

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, ImageReader, Rgba, RgbaImage};
use std::io::Cursor;

use crate::error::CompileError;

/// Alpha (or luminance, for opaque masks) at or below this is "not painted".
pub const MASK_THRESHOLD: u8 = 10;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

const SQUARE_CANVAS: (u32, u32) = (1472, 1472);
const LANDSCAPE_CANVAS: (u32, u32) = (1536, 1024);
const PORTRAIT_CANVAS: (u32, u32) = (1024, 1536);

/// Largest source or mask side we will rasterize at.
pub const MAX_IMAGE_SIDE: u32 = 8192;

/// Read the pixel dimensions of an encoded image without decoding it fully.
///
/// Only the header is read, so sizes above [`MAX_IMAGE_SIDE`] are rejected
/// here rather than trusted for a later allocation.
pub fn image_dimensions(bytes: &[u8], what: &'static str) -> Result<(u32, u32), CompileError> {
    let (width, height) = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| decode_failed(what, e))?
        .into_dimensions()
        .map_err(|e| decode_failed(what, e))?;
    check_size(width, height, what)?;
    Ok((width, height))
}

fn check_size(width: u32, height: u32, what: &'static str) -> Result<(), CompileError> {
    if width == 0 || height == 0 || width > MAX_IMAGE_SIDE || height > MAX_IMAGE_SIDE {
        return Err(CompileError::ImageDecodeFailed {
            what,
            message: format!(
                "unsupported size {}x{} (max {} per side)",
                width, height, MAX_IMAGE_SIDE
            ),
        });
    }
    Ok(())
}

/// Convert a painted mask into the pure black/white mask NovelAI expects.
///
/// The mask is scaled (nearest neighbour) to `width` x `height`, which should
/// be the source image's pixel size. A pixel whose alpha exceeds
/// [`MASK_THRESHOLD`] becomes opaque white (repaint), anything else opaque
/// black. A mask with no transparency at all is judged by luminance instead,
/// so feeding the output back in yields identical bytes.
pub fn rasterize_mask(mask: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CompileError> {
    check_size(width, height, "mask")?;

    let decoded = image::load_from_memory(mask)
        .map_err(|e| decode_failed("mask", e))?
        .to_rgba8();

    let scaled = if decoded.dimensions() == (width, height) {
        decoded
    } else {
        imageops::resize(&decoded, width, height, FilterType::Nearest)
    };

    let opaque = scaled.pixels().all(|p| p[3] == u8::MAX);
    let binary = RgbaImage::from_fn(width, height, |x, y| {
        let pixel = scaled.get_pixel(x, y);
        let coverage = if opaque { luminance(pixel) } else { pixel[3] };
        if coverage > MASK_THRESHOLD {
            WHITE
        } else {
            BLACK
        }
    });

    encode_png(binary, "mask")
}

/// Pick the fixed reference canvas for an image of the given size.
pub fn letterbox_canvas(width: u32, height: u32) -> (u32, u32) {
    if width > height {
        LANDSCAPE_CANVAS
    } else if height > width {
        PORTRAIT_CANVAS
    } else {
        SQUARE_CANVAS
    }
}

/// Fit a character reference onto its canvas, centred on opaque black.
pub fn letterbox_reference(image: &[u8]) -> Result<Vec<u8>, CompileError> {
    let source = image::load_from_memory(image).map_err(|e| decode_failed("character reference", e))?;
    let (width, height) = (source.width(), source.height());
    if width == 0 || height == 0 {
        return Err(CompileError::ImageDecodeFailed {
            what: "character reference",
            message: "image has no pixels".into(),
        });
    }

    let (canvas_w, canvas_h) = letterbox_canvas(width, height);
    let scale = f64::min(
        canvas_w as f64 / width as f64,
        canvas_h as f64 / height as f64,
    );
    let fit_w = ((width as f64 * scale).round() as u32).clamp(1, canvas_w);
    let fit_h = ((height as f64 * scale).round() as u32).clamp(1, canvas_h);

    let resized = source
        .resize_exact(fit_w, fit_h, FilterType::Lanczos3)
        .to_rgba8();
    let mut canvas = RgbaImage::from_pixel(canvas_w, canvas_h, BLACK);
    imageops::overlay(
        &mut canvas,
        &resized,
        ((canvas_w - fit_w) / 2) as i64,
        ((canvas_h - fit_h) / 2) as i64,
    );

    encode_png(canvas, "character reference")
}

fn luminance(pixel: &Rgba<u8>) -> u8 {
    let [r, g, b, _] = pixel.0;
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}

fn encode_png(buffer: RgbaImage, what: &'static str) -> Result<Vec<u8>, CompileError> {
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(buffer)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| CompileError::ImageEncodeFailed {
            what,
            message: e.to_string(),
        })?;
    Ok(out)
}

fn decode_failed(what: &'static str, err: impl std::fmt::Display) -> CompileError {
    CompileError::ImageDecodeFailed {
        what,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(buffer: RgbaImage) -> Vec<u8> {
        encode_png(buffer, "test").unwrap()
    }

    fn decode(bytes: &[u8]) -> RgbaImage {
        image::load_from_memory(bytes).unwrap().to_rgba8()
    }

    /// Transparent canvas with a translucent red stroke in the top-left quadrant.
    fn painted_mask(width: u32, height: u32) -> Vec<u8> {
        png(RgbaImage::from_fn(width, height, |x, y| {
            if x < width / 2 && y < height / 2 {
                Rgba([200, 30, 30, 128])
            } else if x == width - 1 {
                Rgba([255, 255, 255, 5])
            } else {
                Rgba([0, 0, 0, 0])
            }
        }))
    }

    #[test]
    fn test_rasterize_binarizes_by_alpha() {
        let out = decode(&rasterize_mask(&painted_mask(8, 8), 8, 8).unwrap());
        assert_eq!(out.dimensions(), (8, 8));
        assert_eq!(*out.get_pixel(0, 0), WHITE);
        assert_eq!(*out.get_pixel(6, 6), BLACK);
        // alpha 5 is below the noise threshold
        assert_eq!(*out.get_pixel(7, 0), BLACK);
        assert!(out.pixels().all(|p| *p == WHITE || *p == BLACK));
    }

    #[test]
    fn test_rasterize_scales_to_target() {
        let out = decode(&rasterize_mask(&painted_mask(8, 8), 16, 4).unwrap());
        assert_eq!(out.dimensions(), (16, 4));
        assert_eq!(*out.get_pixel(0, 0), WHITE);
        assert_eq!(*out.get_pixel(15, 3), BLACK);
    }

    #[test]
    fn test_rasterize_is_idempotent() {
        let once = rasterize_mask(&painted_mask(12, 10), 12, 10).unwrap();
        let twice = rasterize_mask(&once, 12, 10).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_rasterize_rejects_garbage() {
        let err = rasterize_mask(b"not an image", 8, 8).unwrap_err();
        assert!(matches!(err, CompileError::ImageDecodeFailed { what: "mask", .. }));
    }

    #[test]
    fn test_rasterize_rejects_zero_target() {
        assert!(rasterize_mask(&painted_mask(4, 4), 0, 4).is_err());
    }

    #[test]
    fn test_letterbox_canvas_choice() {
        assert_eq!(letterbox_canvas(800, 600), (1536, 1024));
        assert_eq!(letterbox_canvas(600, 800), (1024, 1536));
        assert_eq!(letterbox_canvas(512, 512), (1472, 1472));
    }

    #[test]
    fn test_letterbox_centres_on_black() {
        // 40x10 white strip on a landscape canvas: scaled to 1536x384, centred vertically.
        let strip = png(RgbaImage::from_pixel(40, 10, WHITE));
        let out = decode(&letterbox_reference(&strip).unwrap());
        assert_eq!(out.dimensions(), (1536, 1024));
        assert_eq!(*out.get_pixel(0, 0), BLACK);
        assert_eq!(*out.get_pixel(768, 1023), BLACK);
        assert_eq!(*out.get_pixel(768, 512), WHITE);
    }

    #[test]
    fn test_image_dimensions() {
        let bytes = png(RgbaImage::from_pixel(33, 17, BLACK));
        assert_eq!(image_dimensions(&bytes, "source").unwrap(), (33, 17));
        assert!(image_dimensions(b"nope", "source").is_err());
    }

    fn crc32(data: &[u8]) -> u32 {
        let mut crc = 0xFFFF_FFFFu32;
        for &byte in data {
            crc ^= byte as u32;
            for _ in 0..8 {
                let mask = (crc & 1).wrapping_neg();
                crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
            }
        }
        !crc
    }

    /// A valid 1x1 PNG whose IHDR claims `width` x `height`.
    fn lying_png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = png(RgbaImage::from_pixel(1, 1, BLACK));
        bytes[16..20].copy_from_slice(&width.to_be_bytes());
        bytes[20..24].copy_from_slice(&height.to_be_bytes());
        let crc = crc32(&bytes[12..29]);
        bytes[29..33].copy_from_slice(&crc.to_be_bytes());
        bytes
    }

    #[test]
    fn test_image_dimensions_rejects_huge_header() {
        let err = image_dimensions(&lying_png(60_000, 60_000), "source image").unwrap_err();
        assert!(matches!(
            err,
            CompileError::ImageDecodeFailed { what: "source image", .. }
        ));
    }

    #[test]
    fn test_image_dimensions_accepts_max_side() {
        let bytes = lying_png(MAX_IMAGE_SIDE, 16);
        assert_eq!(image_dimensions(&bytes, "source").unwrap(), (MAX_IMAGE_SIDE, 16));
    }

    #[test]
    fn test_rasterize_rejects_oversized_target() {
        let mask = painted_mask(8, 8);
        assert!(matches!(
            rasterize_mask(&mask, MAX_IMAGE_SIDE + 1, 8),
            Err(CompileError::ImageDecodeFailed { what: "mask", .. })
        ));
    }
}
