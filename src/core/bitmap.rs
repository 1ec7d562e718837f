//! # Badge Bitmap Pipeline
//!
//! Converts an RGBA raster into the packed 1-bit bitmap the badge firmware
//! draws. The steps run in a fixed order:
//!
//! 1. **Resize** to exactly the target size (callers normally pass a raster
//!    that already matches, see [`decode_for_badge`])
//! 2. **Luminance**: `Y = 0.2126 R + 0.7152 G + 0.0722 B` (BT.709), alpha ignored
//! 3. **Contrast stretch** to `0..=255`, only when `max - min > 50`
//! 4. **Floyd–Steinberg** error diffusion, single forward pass in raster order
//! 5. **Bit packing**: 8 pixels per byte, MSB first, `1` = ink
//!
//! ```text
//!          x   7/16
//!   3/16  5/16  1/16
//! ```
//!
//! The pipeline is pure: the same raster and size always produce the same
//! bytes.

use image::{DynamicImage, GrayImage, Luma, RgbaImage, imageops::FilterType};

use crate::core::bluetooth::error::LinkError;

/// Dynamic range at or below which the contrast stretch is skipped
pub const CONTRAST_STRETCH_MIN_RANGE: f32 = 50.0;

/// Quantization threshold; lower samples become ink
pub const INK_THRESHOLD: f32 = 128.0;

/// Packed 1-bit image ready for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFrame {
    width: u32,
    height: u32,
    bits: Vec<u8>,
}

impl ImageFrame {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Packed bytes, `ceil(width * height / 8)` long.
    pub fn bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Whether the pixel at (x, y) is ink, `None` outside the frame.
    pub fn is_ink(&self, x: u32, y: u32) -> Option<bool> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = y as usize * self.width as usize + x as usize;
        let byte = self.bits.get(index / 8)?;
        Some(byte & (0x80 >> (index % 8)) != 0)
    }

    /// Renders the frame as a black-on-white grayscale image.
    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            if self.is_ink(x, y) == Some(true) { Luma([0]) } else { Luma([255]) }
        })
    }
}

/// Switches for the optional pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub contrast_stretch: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            contrast_stretch: true,
        }
    }
}

/// Runs the full pipeline with default options.
pub fn render(image: &RgbaImage, width: u32, height: u32) -> Result<ImageFrame, LinkError> {
    render_with(image, width, height, PipelineOptions::default())
}

/// Runs the full pipeline.
pub fn render_with(
    image: &RgbaImage,
    width: u32,
    height: u32,
    options: PipelineOptions,
) -> Result<ImageFrame, LinkError> {
    if width == 0 || height == 0 || image.width() == 0 || image.height() == 0 {
        return Err(LinkError::InvalidDimensions { width, height });
    }

    let resized;
    let raster = if image.dimensions() == (width, height) {
        image
    } else {
        resized = image::imageops::resize(image, width, height, FilterType::Triangle);
        &resized
    };

    let mut plane = luminance(raster);
    if options.contrast_stretch {
        stretch_contrast(&mut plane);
    }
    let dithered = floyd_steinberg(&mut plane, width as usize, height as usize);

    Ok(ImageFrame {
        width,
        height,
        bits: pack_bits(&dithered),
    })
}

/// BT.709 luminance of every pixel, row-major.
pub fn luminance(image: &RgbaImage) -> Vec<f32> {
    image
        .pixels()
        .map(|p| 0.2126 * p[0] as f32 + 0.7152 * p[1] as f32 + 0.0722 * p[2] as f32)
        .collect()
}

/// Stretches the plane to the full `0..=255` range.
///
/// Returns false (and leaves the plane untouched) when the range is 50 or
/// less, which keeps noise on near-flat images from being amplified.
pub fn stretch_contrast(plane: &mut [f32]) -> bool {
    let (min, max) = plane
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });

    let range = max - min;
    if !(range > CONTRAST_STRETCH_MIN_RANGE) {
        return false;
    }

    let factor = 255.0 / range;
    for v in plane.iter_mut() {
        *v = ((*v - min) * factor).clamp(0.0, 255.0);
    }
    true
}

/// Floyd–Steinberg dithering in a single forward pass.
///
/// Consumes the plane as scratch space and returns one byte per pixel,
/// `0` for ink and `255` for background.
pub fn floyd_steinberg(plane: &mut [f32], width: usize, height: usize) -> Vec<u8> {
    let mut out = vec![0u8; width * height];

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            let old = plane[idx];
            let new = if old < INK_THRESHOLD { 0.0 } else { 255.0 };
            out[idx] = new as u8;

            let error = old - new;
            if x + 1 < width {
                plane[idx + 1] += error * (7.0 / 16.0);
            }
            if y + 1 < height {
                if x > 0 {
                    plane[idx + width - 1] += error * (3.0 / 16.0);
                }
                plane[idx + width] += error * (5.0 / 16.0);
                if x + 1 < width {
                    plane[idx + width + 1] += error * (1.0 / 16.0);
                }
            }
        }
    }

    out
}

/// Packs dithered pixels 8 per byte, MSB first; ink (`< 128`) becomes a 1 bit.
/// Unused bits of the last byte stay 0.
pub fn pack_bits(dithered: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; dithered.len().div_ceil(8)];
    for (i, &v) in dithered.iter().enumerate() {
        if (v as f32) < INK_THRESHOLD {
            bytes[i / 8] |= 0x80 >> (i % 8);
        }
    }
    bytes
}

/// Inverse of [`pack_bits`]: `true` for ink, `count` pixels.
pub fn unpack_bits(packed: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| packed[i / 8] & (0x80 >> (i % 8)) != 0)
        .collect()
}

/// Decodes an encoded image (PNG, JPEG, ...) and fits it to a `size`×`size`
/// square by centre-cropping to the shorter side and resizing.
pub fn decode_for_badge(bytes: &[u8], size: u32) -> Result<RgbaImage, LinkError> {
    if size == 0 {
        return Err(LinkError::InvalidDimensions {
            width: size,
            height: size,
        });
    }
    let image = image::load_from_memory(bytes)?;
    Ok(fit_square(&image, size))
}

/// Centre-crops to a square and resizes to `size`×`size`.
pub fn fit_square(image: &DynamicImage, size: u32) -> RgbaImage {
    let side = image.width().min(image.height());
    let x = (image.width() - side) / 2;
    let y = (image.height() - side) / 2;
    image
        .crop_imm(x, y, side, side)
        .resize_exact(size, size, FilterType::Lanczos3)
        .to_rgba8()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use pretty_assertions::assert_eq;

    fn solid(width: u32, height: u32, v: u8) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba([v, v, v, 255]))
    }

    /// Deterministic pseudo-random test card
    fn noise(width: u32, height: u32, seed: u32) -> RgbaImage {
        let mut state = seed.wrapping_mul(2_654_435_761).max(1);
        RgbaImage::from_fn(width, height, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let [a, b, c, _] = state.to_le_bytes();
            Rgba([a, b, c, 255])
        })
    }

    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, _| {
            let v = (x * 255 / (width - 1).max(1)) as u8;
            Rgba([v, v, v, 255])
        })
    }

    #[test]
    fn test_output_length_matches_dimensions() {
        for (w, h) in [(1, 1), (1, 7), (3, 3), (8, 1), (9, 2), (122, 122), (250, 122)] {
            let frame = render(&noise(w, h, w * 31 + h), w, h).unwrap();
            assert_eq!(frame.len(), ((w * h) as usize).div_ceil(8), "{}x{}", w, h);
        }
    }

    #[test]
    fn test_deterministic() {
        let image = noise(122, 122, 42);
        let a = render(&image, 122, 122).unwrap();
        let b = render(&image, 122, 122).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unpack_reproduces_dithered_plane() {
        let image = noise(37, 19, 7);
        let mut plane = luminance(&image);
        stretch_contrast(&mut plane);
        let dithered = floyd_steinberg(&mut plane, 37, 19);
        let packed = pack_bits(&dithered);

        let unpacked = unpack_bits(&packed, dithered.len());
        for (i, (&ink, &d)) in unpacked.iter().zip(dithered.iter()).enumerate() {
            assert_eq!(ink, d < 128, "pixel {}", i);
        }
        assert_eq!(render(&image, 37, 19).unwrap().bytes(), packed.as_slice());
    }

    #[test]
    fn test_flat_image_skips_stretch() {
        // Range of 40 grey levels, below the stretch threshold
        let image = RgbaImage::from_fn(40, 30, |x, y| {
            let v = 100 + ((x + y) % 41) as u8;
            Rgba([v, v, v, 255])
        });
        let with = render_with(&image, 40, 30, PipelineOptions { contrast_stretch: true }).unwrap();
        let without =
            render_with(&image, 40, 30, PipelineOptions { contrast_stretch: false }).unwrap();
        assert_eq!(with, without);
    }

    #[test]
    fn test_stretch_boundary() {
        let mut exactly_fifty = vec![100.0, 150.0, 120.0];
        assert!(!stretch_contrast(&mut exactly_fifty));
        assert_eq!(exactly_fifty, vec![100.0, 150.0, 120.0]);

        let mut wide = vec![100.0, 200.0, 150.0];
        assert!(stretch_contrast(&mut wide));
        assert_eq!(wide[0], 0.0);
        assert!((wide[1] - 255.0).abs() < 1e-3);
        assert!((wide[2] - 127.5).abs() < 1e-3);
    }

    #[test]
    fn test_luminance_weights() {
        let image = RgbaImage::from_vec(
            3,
            1,
            vec![255, 0, 0, 0, 0, 255, 0, 9, 0, 0, 255, 255],
        )
        .unwrap();
        let plane = luminance(&image);
        assert!((plane[0] - 54.213).abs() < 1e-3);
        assert!((plane[1] - 182.376).abs() < 1e-3);
        assert!((plane[2] - 18.411).abs() < 1e-3);
    }

    #[test]
    fn test_solid_black_and_white() {
        let black = render(&solid(16, 2, 0), 16, 2).unwrap();
        assert_eq!(black.bytes(), &[0xFF; 4]);

        let white = render(&solid(16, 2, 255), 16, 2).unwrap();
        assert_eq!(white.bytes(), &[0x00; 4]);
    }

    #[test]
    fn test_padding_bits_are_zero() {
        // 3x3 = 9 pixels, all ink: second byte holds only the MSB
        let frame = render(&solid(3, 3, 0), 3, 3).unwrap();
        assert_eq!(frame.bytes(), &[0xFF, 0x80]);
    }

    #[test]
    fn test_msb_first_ordering() {
        assert_eq!(pack_bits(&[0, 255, 255, 255, 255, 255, 255, 0]), vec![0b1000_0001]);
        assert_eq!(pack_bits(&[]), Vec::<u8>::new());
    }

    #[test]
    fn test_mid_grey_dithers_to_half_ink() {
        let mut plane = vec![127.5f32; 64 * 64];
        let dithered = floyd_steinberg(&mut plane, 64, 64);
        let ink = dithered.iter().filter(|&&v| v == 0).count();
        let ratio = ink as f32 / dithered.len() as f32;
        assert!((0.45..=0.55).contains(&ratio), "ink ratio {}", ratio);
    }

    #[test]
    fn test_gradient_is_darker_on_the_left() {
        let frame = render(&gradient(64, 16), 64, 16).unwrap();
        let ink_in = |x0: u32, x1: u32| {
            (0..16)
                .flat_map(|y| (x0..x1).map(move |x| (x, y)))
                .filter(|&(x, y)| frame.is_ink(x, y) == Some(true))
                .count()
        };
        assert!(ink_in(0, 16) > ink_in(48, 64));
    }

    #[test]
    fn test_resizes_to_target() {
        let frame = render(&noise(50, 20, 3), 10, 10).unwrap();
        assert_eq!((frame.width(), frame.height()), (10, 10));
        assert_eq!(frame.len(), 13);
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        assert!(matches!(
            render(&solid(4, 4, 0), 0, 4),
            Err(LinkError::InvalidDimensions { width: 0, height: 4 })
        ));
    }

    #[test]
    fn test_fit_square_crops_centre() {
        // Left third red, middle green, right third blue
        let wide = RgbaImage::from_fn(300, 100, |x, _| match x / 100 {
            0 => Rgba([255, 0, 0, 255]),
            1 => Rgba([0, 255, 0, 255]),
            _ => Rgba([0, 0, 255, 255]),
        });
        let square = fit_square(&DynamicImage::ImageRgba8(wide), 10);
        assert_eq!(square.dimensions(), (10, 10));
        let centre = square.get_pixel(5, 5);
        assert!(centre[1] > 200 && centre[0] < 50 && centre[2] < 50);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_for_badge(b"definitely not an image", 122),
            Err(LinkError::Image(_))
        ));
    }

    #[test]
    fn test_decode_png_round_trip() {
        let mut png = Vec::new();
        DynamicImage::ImageRgba8(gradient(40, 20))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let decoded = decode_for_badge(&png, 16).unwrap();
        assert_eq!(decoded.dimensions(), (16, 16));
    }

    #[test]
    fn test_is_ink_outside_frame() {
        let frame = render(&noise(9, 5, 11), 9, 5).unwrap();
        assert!(frame.is_ink(8, 4).is_some());
        assert_eq!(frame.is_ink(9, 0), None);
        assert_eq!(frame.is_ink(0, 5), None);
        assert_eq!(frame.is_ink(u32::MAX, u32::MAX), None);
    }

    #[test]
    fn test_gray_preview_matches_bits() {
        let frame = render(&noise(9, 5, 11), 9, 5).unwrap();
        let preview = frame.to_gray_image();
        for y in 0..5 {
            for x in 0..9 {
                let expected = if frame.is_ink(x, y).unwrap() { 0 } else { 255 };
                assert_eq!(preview.get_pixel(x, y)[0], expected);
            }
        }
    }
}
