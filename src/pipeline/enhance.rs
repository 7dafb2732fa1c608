//! Normalization and contrast enhancement of decoded rasters.
//!
//! Decoded products carry anything from 8-bit counts to 32-bit radiance, so
//! the first step always maps samples onto 0–255 with a percentile stretch.
//! Enhancement then works on the 8-bit image:
//!
//! * local equalization: contrast-limited adaptive histogram equalization
//!   over a `tile_grid × tile_grid` grid, bilinearly blended between tiles;
//! * contrast: blend away from the mean luminance by `contrast_factor`;
//! * sharpness: blend away from a 3×3 smoothed copy by `sharpness_factor`.
//!
//! Each step is independent and can be switched off in [`EnhanceOptions`].

use crate::config::EnhanceOptions;
use crate::pipeline::decode::{RasterBuffer, Samples};
use image::{DynamicImage, GrayImage, RgbImage};
use tracing::debug;

/// Above this many samples, percentiles are estimated from every 100th value.
pub const SAMPLING_THRESHOLD: usize = 10_000_000;
const SAMPLING_STEP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stretch {
    /// Use percentiles; `false` stretches between min and max.
    pub percentiles: bool,
    pub low: f64,
    pub high: f64,
}

impl Default for Stretch {
    fn default() -> Self {
        Self {
            percentiles: true,
            low: 2.0,
            high: 98.0,
        }
    }
}

/// Map a raster onto an 8-bit grey (1–2 bands) or RGB (3+ bands) image.
///
/// Uniform input yields an all-black image. An 8-bit raster that already
/// spans most of the range (max > 200, min < 50) is passed through unchanged.
pub fn normalize(raster: &RasterBuffer, stretch: Stretch) -> Option<DynamicImage> {
    let band_len = usize::try_from(raster.pixel_count()).ok()?;
    let bands_used = if raster.bands >= 3 { 3 } else { 1 };
    let used = band_len * bands_used;
    if raster.samples.len() < used || used == 0 {
        return None;
    }

    let planar: Vec<u8> = match &raster.samples {
        Samples::U8(v) if is_well_spread(&v[..used]) => {
            debug!("8-bit input already spans the range, skipping stretch");
            v[..used].to_vec()
        }
        samples => stretch_samples(samples, used, stretch),
    };

    if bands_used == 1 {
        GrayImage::from_raw(raster.width, raster.height, planar).map(DynamicImage::ImageLuma8)
    } else {
        let mut rgb = Vec::with_capacity(used);
        for i in 0..band_len {
            rgb.extend_from_slice(&[planar[i], planar[band_len + i], planar[2 * band_len + i]]);
        }
        RgbImage::from_raw(raster.width, raster.height, rgb).map(DynamicImage::ImageRgb8)
    }
}

fn is_well_spread(v: &[u8]) -> bool {
    let (min, max) = v
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &x| (lo.min(x), hi.max(x)));
    max > 200 && min < 50
}

fn stretch_samples(samples: &Samples, used: usize, stretch: Stretch) -> Vec<u8> {
    let step = if used > SAMPLING_THRESHOLD { SAMPLING_STEP } else { 1 };
    let mut sample: Vec<f64> = samples
        .iter_f64()
        .take(used)
        .step_by(step)
        .filter(|v| v.is_finite())
        .collect();
    sample.sort_by(f64::total_cmp);

    let (lo, hi) = if stretch.percentiles {
        (percentile(&sample, stretch.low), percentile(&sample, stretch.high))
    } else {
        (
            sample.first().copied().unwrap_or(0.0),
            sample.last().copied().unwrap_or(0.0),
        )
    };
    debug!("Stretch bounds {:.3} – {:.3} ({} samples)", lo, hi, sample.len());

    let range = hi - lo;
    if !(range > 0.0) {
        return vec![0; used];
    }
    let scale = 255.0 / range;
    samples
        .iter_f64()
        .take(used)
        .map(|v| {
            if v.is_finite() {
                ((v.clamp(lo, hi) - lo) * scale) as u8
            } else {
                0
            }
        })
        .collect()
}

/// Linear-interpolated percentile of sorted data.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

/// Apply the enabled enhancement steps in place.
pub fn enhance(image: &mut DynamicImage, options: &EnhanceOptions) {
    let (width, height) = (image.width(), image.height());
    let (buf, channels): (&mut [u8], usize) = match image {
        DynamicImage::ImageLuma8(img) => (&mut **img, 1),
        DynamicImage::ImageRgb8(img) => (&mut **img, 3),
        _ => return,
    };

    if options.local_equalization {
        for c in 0..channels {
            clahe(buf, width as usize, height as usize, channels, c, options.clip_limit, options.tile_grid);
        }
    }
    if options.contrast {
        contrast(buf, channels, options.contrast_factor);
    }
    if options.sharpness {
        sharpness(buf, width as usize, height as usize, channels, options.sharpness_factor);
    }
}

/// Contrast-limited adaptive histogram equalization of one channel.
fn clahe(buf: &mut [u8], w: usize, h: usize, channels: usize, c: usize, clip_limit: f32, grid: u32) {
    let nx = (grid as usize).clamp(1, w.max(1));
    let ny = (grid as usize).clamp(1, h.max(1));
    if w == 0 || h == 0 {
        return;
    }

    let bounds = |t: usize, n: usize, len: usize| (t * len / n, (t + 1) * len / n);
    let mut luts = vec![[0u8; 256]; nx * ny];

    for ty in 0..ny {
        let (y0, y1) = bounds(ty, ny, h);
        for tx in 0..nx {
            let (x0, x1) = bounds(tx, nx, w);
            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[buf[(y * w + x) * channels + c] as usize] += 1;
                }
            }
            let area = ((y1 - y0) * (x1 - x0)) as u32;
            luts[ty * nx + tx] = tile_lut(&mut hist, area, clip_limit);
        }
    }

    // Tile centres sit at (t + 0.5) * len / n; blend the four nearest LUTs.
    let coord = |p: usize, n: usize, len: usize| {
        let f = (p as f32 + 0.5) * n as f32 / len as f32 - 0.5;
        let t0 = f.floor().clamp(0.0, (n - 1) as f32) as usize;
        let t1 = (t0 + 1).min(n - 1);
        let a = (f - t0 as f32).clamp(0.0, 1.0);
        (t0, t1, a)
    };

    for y in 0..h {
        let (ty0, ty1, ay) = coord(y, ny, h);
        for x in 0..w {
            let (tx0, tx1, ax) = coord(x, nx, w);
            let i = (y * w + x) * channels + c;
            let v = buf[i] as usize;
            let top = f32::from(luts[ty0 * nx + tx0][v]) * (1.0 - ax) + f32::from(luts[ty0 * nx + tx1][v]) * ax;
            let bottom = f32::from(luts[ty1 * nx + tx0][v]) * (1.0 - ax) + f32::from(luts[ty1 * nx + tx1][v]) * ax;
            buf[i] = (top * (1.0 - ay) + bottom * ay).round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn tile_lut(hist: &mut [u32; 256], area: u32, clip_limit: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    if area == 0 {
        for (v, slot) in lut.iter_mut().enumerate() {
            *slot = v as u8;
        }
        return lut;
    }

    if clip_limit > 0.0 {
        let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > limit {
                excess += *bin - limit;
                *bin = limit;
            }
        }
        let per_bin = excess / 256;
        let remainder = (excess % 256) as usize;
        for (i, bin) in hist.iter_mut().enumerate() {
            *bin += per_bin + u32::from(i < remainder);
        }
    }

    let mut cdf = 0u32;
    for (slot, &count) in lut.iter_mut().zip(hist.iter()) {
        cdf += count;
        *slot = ((cdf as f32 * 255.0 / area as f32).round()).min(255.0) as u8;
    }
    lut
}

/// Blend away from the mean luminance.
fn contrast(buf: &mut [u8], channels: usize, factor: f32) {
    let pixels = buf.len() / channels;
    if pixels == 0 {
        return;
    }
    let sum: f64 = buf
        .chunks_exact(channels)
        .map(|p| match channels {
            3 => 0.299 * f64::from(p[0]) + 0.587 * f64::from(p[1]) + 0.114 * f64::from(p[2]),
            _ => f64::from(p[0]),
        })
        .sum();
    let mean = (sum / pixels as f64 + 0.5).floor() as f32;
    for v in buf.iter_mut() {
        *v = blend(mean, f32::from(*v), factor);
    }
}

/// Blend away from a 3×3 smoothed copy; the one-pixel border is left as is.
fn sharpness(buf: &mut [u8], w: usize, h: usize, channels: usize, factor: f32) {
    if w < 3 || h < 3 {
        return;
    }
    const KERNEL: [[f32; 3]; 3] = [[1.0, 1.0, 1.0], [1.0, 5.0, 1.0], [1.0, 1.0, 1.0]];
    const WEIGHT: f32 = 13.0;

    let original = buf.to_vec();
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            for c in 0..channels {
                let mut acc = 0.0f32;
                for (ky, row) in KERNEL.iter().enumerate() {
                    for (kx, k) in row.iter().enumerate() {
                        acc += k * f32::from(original[((y + ky - 1) * w + (x + kx - 1)) * channels + c]);
                    }
                }
                let i = (y * w + x) * channels + c;
                buf[i] = blend((acc / WEIGHT).round(), f32::from(original[i]), factor);
            }
        }
    }
}

/// `degenerate + factor * (value - degenerate)`, clamped to a byte.
fn blend(degenerate: f32, value: f32, factor: f32) -> u8 {
    (degenerate + factor * (value - degenerate)).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster(width: u32, height: u32, samples: Samples) -> RasterBuffer {
        RasterBuffer {
            width,
            height,
            bands: 1,
            samples,
        }
    }

    #[test]
    fn uniform_input_is_black() {
        let img = normalize(&raster(4, 4, Samples::F32(vec![3.5; 16])), Stretch::default()).unwrap();
        assert!(img.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn stretch_spans_full_range() {
        let values: Vec<u16> = (0..1000).collect();
        let img = normalize(&raster(100, 10, Samples::U16(values)), Stretch::default()).unwrap();
        let bytes = img.as_bytes();
        assert_eq!(bytes[0], 0);
        assert!(bytes[999] >= 254);
        assert!(bytes.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn well_spread_u8_passes_through() {
        let values: Vec<u8> = (0..=255).collect();
        let img = normalize(&raster(16, 16, Samples::U8(values.clone())), Stretch::default()).unwrap();
        assert_eq!(img.as_bytes(), &values[..]);
    }

    #[test]
    fn three_bands_become_rgb() {
        let r = RasterBuffer {
            width: 2,
            height: 1,
            bands: 3,
            samples: Samples::I16(vec![0, 100, 0, 0, 100, 100]),
        };
        let img = normalize(&r, Stretch { percentiles: false, low: 0.0, high: 100.0 }).unwrap();
        assert_eq!(img.as_bytes(), &[0, 0, 255, 255, 0, 255]);
    }

    #[test]
    fn percentile_matches_linear_interpolation() {
        let data = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&data, 0.0), 1.0);
        assert_eq!(percentile(&data, 100.0), 4.0);
        assert!((percentile(&data, 50.0) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn enhancement_keeps_dimensions_and_widens_low_contrast() {
        // 16 grey levels, evenly spread inside every 32x32 tile.
        let (w, h) = (256u32, 256u32);
        let data: Vec<u8> = (0..h)
            .flat_map(|y| (0..w).map(move |x| 100 + ((x + 7 * y) % 16) as u8))
            .collect();
        let mut img = DynamicImage::ImageLuma8(GrayImage::from_raw(w, h, data).unwrap());
        enhance(&mut img, &EnhanceOptions::default());
        assert_eq!((img.width(), img.height()), (w, h));
        let (min, max) = img
            .as_bytes()
            .iter()
            .fold((255u8, 0u8), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        assert!(max - min > 30, "expected a wider range than 15 levels, got {min}..{max}");
    }

    #[test]
    fn disabled_steps_leave_image_untouched() {
        let data: Vec<u8> = (0..=255).collect();
        let mut img = DynamicImage::ImageLuma8(GrayImage::from_raw(16, 16, data.clone()).unwrap());
        enhance(&mut img, &EnhanceOptions::none());
        assert_eq!(img.as_bytes(), &data[..]);
    }

    #[test]
    fn contrast_factor_one_is_identity() {
        let mut buf: Vec<u8> = (0..=255).collect();
        let before = buf.clone();
        contrast(&mut buf, 1, 1.0);
        assert_eq!(buf, before);
    }
}
