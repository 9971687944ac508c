//! Image preprocessing: photograph → legible, high-contrast sheet image.
//!
//! Phone captures of answer sheets arrive small, tilted and unevenly lit.
//! Vision backends read bubbles far more reliably once the sheet is upright,
//! flat-lit and binarised, so every photo goes through a fixed six-step
//! pipeline before it is sent anywhere:
//!
//! ```text
//! upscale ─▶ shadows ─▶ perspective ─▶ CLAHE ─▶ sharpen ─▶ threshold
//! (2x)       (÷ blur)   (4-point warp)  (luma)   (3x3)     (Otsu | adaptive)
//! ```
//!
//! Order matters: shadow reduction flattens lighting so edge detection finds
//! the sheet border, CLAHE works on the warped sheet only, and thresholding
//! runs last on the sharpened signal.
//!
//! ## Why absorb every step failure?
//!
//! A half-enhanced image is still readable; a rejected upload is not. Each
//! step runs under its own guard and passes its input through unchanged on
//! error or panic. The [`PreprocessReport`] records exactly which steps
//! applied, which were skipped and why.
//!
//! ## Why spawn_blocking?
//!
//! Blurring and warping a 20-megapixel image takes hundreds of milliseconds
//! of pure CPU. `tokio::task::spawn_blocking` keeps that off the async
//! worker threads that drive provider network calls.

use crate::config::{BinarizationMode, PreprocessOptions};
use crate::error::SheetOcrError;
use crate::pipeline::input::{legibility_warning, AnswerSheetImage, MediaType};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::find_contours;
use imageproc::contrast::{otsu_level, threshold, ThresholdType};
use imageproc::edges::canny;
use imageproc::filter::{filter3x3, gaussian_blur_f32};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::point::Point;
use serde::Serialize;
use std::fmt;
use std::io::Cursor;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Long edge of the downscaled copy used for sheet-border detection.
const DETECTION_LONG_EDGE: u32 = 1000;
/// Canny hysteresis thresholds for sheet-border detection.
const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;
/// Polygon approximation tolerance, as a fraction of the contour perimeter.
const APPROX_EPSILON_RATIO: f64 = 0.02;
/// High-pass kernel: centre 9, the eight neighbours -1.
const SHARPEN_KERNEL: [i32; 9] = [-1, -1, -1, -1, 9, -1, -1, -1, -1];
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// A vision-ready sheet image plus a record of how it was produced.
///
/// Created once by [`preprocess`]; never mutated afterwards.
#[derive(Clone)]
pub struct PreprocessedImage {
    bytes: Vec<u8>,
    media_type: MediaType,
    report: PreprocessReport,
}

/// What the preprocessor did to one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PreprocessReport {
    /// Names of the steps that changed the image, in order.
    pub applied: Vec<String>,
    /// Steps that ran but decided there was nothing to do.
    pub skipped: Vec<StepNote>,
    /// Steps that errored or panicked and were passed through.
    pub failed: Vec<StepNote>,
    /// Quality warnings about the source photo.
    pub warnings: Vec<String>,
    pub source_width: u32,
    pub source_height: u32,
    pub width: u32,
    pub height: u32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepNote {
    pub step: String,
    pub reason: String,
}

impl PreprocessedImage {
    /// Wrap an already-encoded image without enhancing it.
    pub fn unprocessed(sheet: &AnswerSheetImage) -> Result<Self, SheetOcrError> {
        let img = sheet.decode()?;
        let (w, h) = (img.width(), img.height());
        Ok(Self {
            bytes: sheet.bytes().to_vec(),
            media_type: sheet.media_type(),
            report: PreprocessReport {
                warnings: legibility_warning(w, h).into_iter().collect(),
                source_width: w,
                source_height: h,
                width: w,
                height: h,
                ..Default::default()
            },
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Names of the steps that actually applied.
    pub fn steps(&self) -> &[String] {
        &self.report.applied
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.report.width, self.report.height)
    }

    pub fn report(&self) -> &PreprocessReport {
        &self.report
    }
}

impl fmt::Debug for PreprocessedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreprocessedImage")
            .field("media_type", &self.media_type)
            .field("bytes", &format_args!("<{} bytes>", self.bytes.len()))
            .field("report", &self.report)
            .finish()
    }
}

/// Preprocess a sheet on the blocking thread pool.
///
/// Fails only when the input cannot be decoded at all; every enhancement
/// step is best-effort.
pub async fn preprocess(
    sheet: AnswerSheetImage,
    options: &PreprocessOptions,
) -> Result<PreprocessedImage, SheetOcrError> {
    let options = options.clone();
    tokio::task::spawn_blocking(move || preprocess_blocking(&sheet, &options))
        .await
        .map_err(|e| SheetOcrError::Internal(format!("Preprocess task panicked: {}", e)))?
}

/// Blocking implementation of [`preprocess`].
pub fn preprocess_blocking(
    sheet: &AnswerSheetImage,
    options: &PreprocessOptions,
) -> Result<PreprocessedImage, SheetOcrError> {
    if !options.enabled {
        debug!("Preprocessing disabled; forwarding original image");
        return PreprocessedImage::unprocessed(sheet);
    }

    let start = Instant::now();
    let source = sheet.decode()?.to_rgb8();
    let (source_width, source_height) = source.dimensions();
    let mut report = PreprocessReport {
        warnings: legibility_warning(source_width, source_height)
            .into_iter()
            .collect(),
        source_width,
        source_height,
        ..Default::default()
    };
    for w in &report.warnings {
        warn!("Sheet photo: {}", w);
    }

    let mut img = source;
    img = run_step(
        &format!("zoom_{}x", options.zoom_factor),
        img,
        &mut report,
        |i| upscale(i, options.zoom_factor, options.max_long_edge),
    );
    img = run_step("shadow_reduced", img, &mut report, |i| {
        reduce_shadows(i, options.shadow_blur_sigma)
    });
    img = run_step("perspective_corrected", img, &mut report, |i| {
        correct_perspective(i, options.min_quad_area_ratio)
    });
    img = run_step("clahe_applied", img, &mut report, |i| {
        equalize_luminance(i, options.clahe_clip_limit, options.clahe_tiles)
    });
    img = run_step("sharpened", img, &mut report, sharpen);

    let threshold_step = match options.binarization {
        BinarizationMode::Otsu => Some("threshold_otsu"),
        BinarizationMode::Adaptive => Some("threshold_adaptive"),
        BinarizationMode::None => None,
    };
    if let Some(name) = threshold_step {
        img = run_step(name, img, &mut report, |i| {
            binarize(i, options.binarization, options.adaptive_block_size, options.adaptive_c)
        });
    }
    let binarized = threshold_step.is_some_and(|name| report.applied.iter().any(|s| s == name));

    let (width, height) = img.dimensions();
    let encoded = if binarized {
        DynamicImage::ImageLuma8(imageops::grayscale(&img))
    } else {
        DynamicImage::ImageRgb8(img)
    };
    let mut bytes = Vec::new();
    encoded
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| SheetOcrError::Internal(format!("PNG encode failed: {e}")))?;

    report.width = width;
    report.height = height;
    report.elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        "Preprocessed {}x{} → {}x{} in {}ms [{}]",
        source_width,
        source_height,
        width,
        height,
        report.elapsed_ms,
        report.applied.join(", ")
    );

    Ok(PreprocessedImage {
        bytes,
        media_type: MediaType::Png,
        report,
    })
}

// ── Step runner ──────────────────────────────────────────────────────────

enum StepOutcome {
    Applied(RgbImage),
    Skipped(String),
}

fn run_step<F>(name: &str, img: RgbImage, report: &mut PreprocessReport, step: F) -> RgbImage
where
    F: FnOnce(&RgbImage) -> Result<StepOutcome, String>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| step(&img)));
    let note = |reason: String| StepNote {
        step: name.to_string(),
        reason,
    };
    match outcome {
        Ok(Ok(StepOutcome::Applied(out))) => {
            debug!("Step {} applied ({}x{})", name, out.width(), out.height());
            report.applied.push(name.to_string());
            out
        }
        Ok(Ok(StepOutcome::Skipped(reason))) => {
            debug!("Step {} skipped: {}", name, reason);
            report.skipped.push(note(reason));
            img
        }
        Ok(Err(reason)) => {
            warn!("Step {} failed, passing image through: {}", name, reason);
            report.failed.push(note(reason));
            img
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            warn!("Step {} panicked, passing image through: {}", name, reason);
            report.failed.push(note(reason));
            img
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

// ── 1. Upscale ───────────────────────────────────────────────────────────

fn upscale(img: &RgbImage, factor: u32, max_long_edge: u32) -> Result<StepOutcome, String> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err("empty image".into());
    }
    let long = w.max(h) as f64;
    let scale = (factor as f64).min(max_long_edge as f64 / long);
    if scale <= 1.0 {
        return Ok(StepOutcome::Skipped(format!(
            "long edge {long} already at limit {max_long_edge}"
        )));
    }
    let nw = ((w as f64 * scale).round() as u32).max(1);
    let nh = ((h as f64 * scale).round() as u32).max(1);
    Ok(StepOutcome::Applied(imageops::resize(
        img,
        nw,
        nh,
        FilterType::CatmullRom,
    )))
}

// ── 2. Shadow reduction ──────────────────────────────────────────────────

/// Divide by a heavily blurred copy so paper reads as uniform white.
fn reduce_shadows(img: &RgbImage, sigma: f32) -> Result<StepOutcome, String> {
    if sigma <= 0.0 {
        return Err(format!("blur sigma must be positive, got {sigma}"));
    }
    let gray = imageops::grayscale(img);
    let background = gaussian_blur_f32(&gray, sigma);
    let flat = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let g = gray.get_pixel(x, y)[0] as f32;
        let b = background.get_pixel(x, y)[0].max(1) as f32;
        Luma([(g * 255.0 / b).min(255.0) as u8])
    });
    Ok(StepOutcome::Applied(DynamicImage::ImageLuma8(flat).to_rgb8()))
}

// ── 3. Perspective correction ────────────────────────────────────────────

fn correct_perspective(img: &RgbImage, min_area_ratio: f64) -> Result<StepOutcome, String> {
    let (w, h) = img.dimensions();
    let scale = (DETECTION_LONG_EDGE as f64 / w.max(h) as f64).min(1.0);
    let gray = imageops::grayscale(img);
    let small = if scale < 1.0 {
        imageops::resize(
            &gray,
            ((w as f64 * scale).round() as u32).max(1),
            ((h as f64 * scale).round() as u32).max(1),
            FilterType::Triangle,
        )
    } else {
        gray
    };

    let Some(quad) = find_sheet_quad(&small, min_area_ratio)? else {
        return Ok(StepOutcome::Skipped("no sheet-sized quadrilateral found".into()));
    };
    let corners = quad.map(|(x, y)| ((x / scale) as f32, (y / scale) as f32));
    let [tl, tr, br, bl] = corners;

    let out_w = distance(br, bl).max(distance(tr, tl)).round() as u32;
    let out_h = distance(tr, br).max(distance(tl, bl)).round() as u32;
    if out_w < 2 || out_h < 2 {
        return Ok(StepOutcome::Skipped("degenerate quadrilateral".into()));
    }
    let target = [
        (0.0, 0.0),
        (out_w as f32 - 1.0, 0.0),
        (out_w as f32 - 1.0, out_h as f32 - 1.0),
        (0.0, out_h as f32 - 1.0),
    ];
    let projection = Projection::from_control_points(corners, target)
        .ok_or_else(|| "corner points do not define a projection".to_string())?;

    let mut out = RgbImage::from_pixel(out_w, out_h, WHITE);
    warp_into(img, &projection, Interpolation::Bilinear, WHITE, &mut out);
    Ok(StepOutcome::Applied(out))
}

/// Locate the sheet border as ordered corners `[tl, tr, br, bl]`.
fn find_sheet_quad(gray: &GrayImage, min_area_ratio: f64) -> Result<Option<[(f64, f64); 4]>, String> {
    let blurred = gaussian_blur_f32(gray, 1.1);
    let edges = canny(&blurred, CANNY_LOW, CANNY_HIGH);
    let contours = find_contours::<i32>(&edges);

    let largest = contours
        .iter()
        .filter(|c| c.parent.is_none() && c.points.len() >= 4)
        .map(|c| (polygon_area(&c.points), c))
        .max_by(|a, b| a.0.total_cmp(&b.0));
    let Some((_, contour)) = largest else {
        return Ok(None);
    };

    let perimeter = arc_length(&contour.points, true);
    if perimeter <= 0.0 {
        return Ok(None);
    }
    let epsilon = APPROX_EPSILON_RATIO * perimeter;
    let approx = approximate_polygon_dp(&contour.points, epsilon, true);
    let poly = prune_collinear(&approx, epsilon);
    if poly.len() != 4 {
        debug!("Largest contour approximates to {} points", poly.len());
        return Ok(None);
    }
    if !is_convex(&poly) {
        return Ok(None);
    }
    let image_area = gray.width() as f64 * gray.height() as f64;
    let area = polygon_area(&poly);
    if area < min_area_ratio * image_area {
        debug!(
            "Quadrilateral covers {:.1}% of image, below {:.0}%",
            100.0 * area / image_area,
            100.0 * min_area_ratio
        );
        return Ok(None);
    }
    Ok(Some(order_corners(&poly)))
}

/// Shoelace area of a closed polygon.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let twice: i64 = (0..n)
        .map(|i| {
            let (a, b) = (points[i], points[(i + 1) % n]);
            a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64
        })
        .sum();
    (twice as f64 / 2.0).abs()
}

/// Drop duplicate vertices and vertices lying on the segment between their neighbours.
fn prune_collinear(points: &[Point<i32>], epsilon: f64) -> Vec<Point<i32>> {
    let mut poly: Vec<Point<i32>> = Vec::with_capacity(points.len());
    for p in points {
        if poly.last().is_none_or(|q| q != p) {
            poly.push(*p);
        }
    }
    if poly.len() > 1 && poly.first() == poly.last() {
        poly.pop();
    }
    loop {
        let n = poly.len();
        if n <= 3 {
            return poly;
        }
        let redundant = (0..n).find(|&i| {
            let prev = poly[(i + n - 1) % n];
            let next = poly[(i + 1) % n];
            line_distance(poly[i], prev, next) < epsilon
        });
        match redundant {
            Some(i) => {
                poly.remove(i);
            }
            None => return poly,
        }
    }
}

fn line_distance(p: Point<i32>, a: Point<i32>, b: Point<i32>) -> f64 {
    let (dx, dy) = ((b.x - a.x) as f64, (b.y - a.y) as f64);
    let len = (dx * dx + dy * dy).sqrt();
    if len == 0.0 {
        return (((p.x - a.x) as f64).powi(2) + ((p.y - a.y) as f64).powi(2)).sqrt();
    }
    (dy * (p.x - a.x) as f64 - dx * (p.y - a.y) as f64).abs() / len
}

fn is_convex(poly: &[Point<i32>]) -> bool {
    let n = poly.len();
    let mut sign = 0i64;
    for i in 0..n {
        let (a, b, c) = (poly[i], poly[(i + 1) % n], poly[(i + 2) % n]);
        let cross = (b.x - a.x) as i64 * (c.y - b.y) as i64 - (b.y - a.y) as i64 * (c.x - b.x) as i64;
        if cross != 0 {
            if sign != 0 && cross.signum() != sign {
                return false;
            }
            sign = cross.signum();
        }
    }
    sign != 0
}

/// Order four points as top-left, top-right, bottom-right, bottom-left.
///
/// Top-left has the smallest x+y, bottom-right the largest; top-right has
/// the smallest y-x, bottom-left the largest.
fn order_corners(poly: &[Point<i32>]) -> [(f64, f64); 4] {
    let pts: Vec<(f64, f64)> = poly.iter().map(|p| (p.x as f64, p.y as f64)).collect();
    let by = |key: fn(&(f64, f64)) -> f64, max: bool| {
        let it = pts.iter().copied();
        let pick = if max {
            it.max_by(|a, b| key(a).total_cmp(&key(b)))
        } else {
            it.min_by(|a, b| key(a).total_cmp(&key(b)))
        };
        pick.unwrap_or((0.0, 0.0))
    };
    let sum = |p: &(f64, f64)| p.0 + p.1;
    let diff = |p: &(f64, f64)| p.1 - p.0;
    [by(sum, false), by(diff, false), by(sum, true), by(diff, true)]
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

// ── 4. CLAHE on luminance ────────────────────────────────────────────────

/// Equalise the Y channel of YCbCr and shift RGB by the same delta.
///
/// With Cb and Cr held fixed every RGB channel moves by exactly the change
/// in Y, so hue is preserved.
fn equalize_luminance(img: &RgbImage, clip_limit: f32, tiles: u32) -> Result<StepOutcome, String> {
    if tiles == 0 {
        return Err("tile grid must be at least 1x1".into());
    }
    let luma = GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let [r, g, b] = img.get_pixel(x, y).0;
        Luma([(0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8])
    });
    let equalized = clahe(&luma, clip_limit, tiles);
    let out = RgbImage::from_fn(img.width(), img.height(), |x, y| {
        let delta = equalized.get_pixel(x, y)[0] as i32 - luma.get_pixel(x, y)[0] as i32;
        let shift = |c: u8| (c as i32 + delta).clamp(0, 255) as u8;
        let [r, g, b] = img.get_pixel(x, y).0;
        Rgb([shift(r), shift(g), shift(b)])
    });
    Ok(StepOutcome::Applied(out))
}

/// Contrast-limited adaptive histogram equalisation with bilinear blending
/// between tile lookup tables.
fn clahe(img: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    let tile_w = w.div_ceil(tiles.min(w).max(1)).max(1);
    let tile_h = h.div_ceil(tiles.min(h).max(1)).max(1);
    let nx = w.div_ceil(tile_w).max(1);
    let ny = h.div_ceil(tile_h).max(1);

    let mut luts = vec![[0u8; 256]; (nx * ny) as usize];
    for ty in 0..ny {
        for tx in 0..nx {
            let (x0, x1) = (tx * tile_w, ((tx + 1) * tile_w).min(w));
            let (y0, y1) = (ty * tile_h, ((ty + 1) * tile_h).min(h));
            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[img.get_pixel(x, y)[0] as usize] += 1;
                }
            }
            let area = ((x1 - x0) * (y1 - y0)).max(1);
            let limit = (clip_limit * area as f32 / 256.0).max(1.0) as u32;
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > limit {
                    excess += *bin - limit;
                    *bin = limit;
                }
            }
            let (bonus, residual) = (excess / 256, excess % 256);
            let lut = &mut luts[(ty * nx + tx) as usize];
            let mut cumulative = 0u32;
            for (i, bin) in hist.iter().enumerate() {
                cumulative += bin + bonus + u32::from((i as u32) < residual);
                lut[i] = (cumulative as f32 * 255.0 / area as f32).round().min(255.0) as u8;
            }
        }
    }

    let grid = |f: f32, n: u32| {
        let lo = f.floor();
        let frac = f - lo;
        let clamp = |v: f32| v.max(0.0).min((n - 1) as f32) as u32;
        (clamp(lo), clamp(lo + 1.0), frac)
    };
    GrayImage::from_fn(w, h, |x, y| {
        let v = img.get_pixel(x, y)[0] as usize;
        let (x_lo, x_hi, ax) = grid((x as f32 + 0.5) / tile_w as f32 - 0.5, nx);
        let (y_lo, y_hi, ay) = grid((y as f32 + 0.5) / tile_h as f32 - 0.5, ny);
        let at = |tx: u32, ty: u32| luts[(ty * nx + tx) as usize][v] as f32;
        let top = at(x_lo, y_lo) * (1.0 - ax) + at(x_hi, y_lo) * ax;
        let bottom = at(x_lo, y_hi) * (1.0 - ax) + at(x_hi, y_hi) * ax;
        Luma([(top * (1.0 - ay) + bottom * ay).round().clamp(0.0, 255.0) as u8])
    })
}

// ── 5. Sharpen ───────────────────────────────────────────────────────────

fn sharpen(img: &RgbImage) -> Result<StepOutcome, String> {
    let (w, h) = img.dimensions();
    if w < 3 || h < 3 {
        return Ok(StepOutcome::Skipped(format!("{w}x{h} too small to sharpen")));
    }
    Ok(StepOutcome::Applied(filter3x3::<_, i32, u8>(img, &SHARPEN_KERNEL)))
}

// ── 6. Binarize ──────────────────────────────────────────────────────────

fn binarize(
    img: &RgbImage,
    mode: BinarizationMode,
    block_size: u32,
    c: i32,
) -> Result<StepOutcome, String> {
    let gray = imageops::grayscale(img);
    let bw = match mode {
        BinarizationMode::Otsu => {
            let level = otsu_level(&gray);
            debug!("Otsu level {}", level);
            threshold(&gray, level, ThresholdType::Binary)
        }
        BinarizationMode::Adaptive => threshold_adaptive(&gray, block_size, c)?,
        BinarizationMode::None => return Ok(StepOutcome::Skipped("binarization disabled".into())),
    };
    Ok(StepOutcome::Applied(DynamicImage::ImageLuma8(bw).to_rgb8()))
}

/// Local mean threshold: a pixel is white when brighter than its window mean minus `c`.
///
/// `imageproc::contrast::adaptive_threshold` has no offset, and without one
/// the paper grain inside empty bubbles comes out as noise.
fn threshold_adaptive(gray: &GrayImage, block_size: u32, c: i32) -> Result<GrayImage, String> {
    if block_size < 3 || block_size % 2 == 0 {
        return Err(format!("block size must be odd and >= 3, got {block_size}"));
    }
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let mut integral = vec![0u64; (w + 1) * (h + 1)];
    for y in 0..h {
        let mut row = 0u64;
        for x in 0..w {
            row += gray.get_pixel(x as u32, y as u32)[0] as u64;
            integral[(y + 1) * (w + 1) + x + 1] = integral[y * (w + 1) + x + 1] + row;
        }
    }
    let r = (block_size / 2) as usize;
    Ok(GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let (x0, x1) = (x.saturating_sub(r), (x + r + 1).min(w));
        let (y0, y1) = (y.saturating_sub(r), (y + r + 1).min(h));
        let sum = integral[y1 * (w + 1) + x1] + integral[y0 * (w + 1) + x0]
            - integral[y0 * (w + 1) + x1]
            - integral[y1 * (w + 1) + x0];
        let mean = sum as f64 / ((x1 - x0) * (y1 - y0)) as f64;
        let v = gray.get_pixel(x as u32, y as u32)[0] as f64;
        Luma([if v > mean - c as f64 { 255 } else { 0 }])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageproc::drawing::draw_polygon_mut;

    fn sheet_from(img: DynamicImage) -> AnswerSheetImage {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        AnswerSheetImage::from_bytes(buf).unwrap()
    }

    fn tilted_sheet() -> RgbImage {
        let mut img = RgbImage::from_pixel(300, 300, Rgb([20, 20, 20]));
        let quad = [
            Point::new(40, 60),
            Point::new(250, 30),
            Point::new(270, 260),
            Point::new(30, 240),
        ];
        draw_polygon_mut(&mut img, &quad, WHITE);
        img
    }

    #[test]
    fn upscale_doubles_dimensions() {
        let img = RgbImage::new(10, 20);
        match upscale(&img, 2, 6000).unwrap() {
            StepOutcome::Applied(out) => assert_eq!(out.dimensions(), (20, 40)),
            StepOutcome::Skipped(r) => panic!("skipped: {r}"),
        }
    }

    #[test]
    fn upscale_respects_long_edge_cap() {
        let img = RgbImage::new(100, 50);
        match upscale(&img, 2, 150).unwrap() {
            StepOutcome::Applied(out) => assert_eq!(out.dimensions(), (150, 75)),
            StepOutcome::Skipped(r) => panic!("skipped: {r}"),
        }
        assert!(matches!(upscale(&img, 2, 100).unwrap(), StepOutcome::Skipped(_)));
    }

    #[test]
    fn shadow_reduction_flattens_gradient() {
        let img = RgbImage::from_fn(64, 64, |x, _| {
            let v = 120 + (x * 2) as u8;
            Rgb([v, v, v])
        });
        let StepOutcome::Applied(out) = reduce_shadows(&img, 8.0).unwrap() else {
            panic!("expected applied");
        };
        let left = out.get_pixel(20, 32)[0] as i32;
        let right = out.get_pixel(44, 32)[0] as i32;
        assert!((left - right).abs() < 20, "left={left} right={right}");
    }

    #[test]
    fn corners_are_ordered() {
        let pts = [
            Point::new(250, 30),
            Point::new(30, 240),
            Point::new(40, 60),
            Point::new(270, 260),
        ];
        let [tl, tr, br, bl] = order_corners(&pts);
        assert_eq!(tl, (40.0, 60.0));
        assert_eq!(tr, (250.0, 30.0));
        assert_eq!(br, (270.0, 260.0));
        assert_eq!(bl, (30.0, 240.0));
    }

    #[test]
    fn convexity_and_area() {
        let square = [
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(10, 10),
            Point::new(0, 10),
        ];
        assert!(is_convex(&square));
        assert_eq!(polygon_area(&square), 100.0);
        let dart = [
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(3, 3),
            Point::new(0, 10),
        ];
        assert!(!is_convex(&dart));
    }

    #[test]
    fn collinear_vertex_pruned() {
        let pts = [
            Point::new(0, 0),
            Point::new(50, 0),
            Point::new(100, 0),
            Point::new(100, 100),
            Point::new(0, 100),
        ];
        assert_eq!(prune_collinear(&pts, 2.0).len(), 4);
    }

    #[test]
    fn perspective_warps_tilted_sheet() {
        let img = tilted_sheet();
        let StepOutcome::Applied(out) = correct_perspective(&img, 0.2).unwrap() else {
            panic!("expected perspective correction");
        };
        let (w, h) = out.dimensions();
        assert!((200..=260).contains(&w), "width {w}");
        assert!((190..=250).contains(&h), "height {h}");
        // Centre of the warped sheet is paper, not background.
        assert!(out.get_pixel(w / 2, h / 2)[0] > 200);
    }

    #[test]
    fn perspective_skips_blank_image() {
        let img = RgbImage::from_pixel(100, 100, WHITE);
        assert!(matches!(
            correct_perspective(&img, 0.2).unwrap(),
            StepOutcome::Skipped(_)
        ));
    }

    #[test]
    fn clahe_keeps_dimensions_and_stretches_contrast() {
        let img = GrayImage::from_fn(64, 64, |x, _| Luma([100 + (x % 16) as u8]));
        let out = clahe(&img, 4.0, 8);
        assert_eq!(out.dimensions(), (64, 64));
        let (min, max) = out
            .pixels()
            .fold((255u8, 0u8), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
        assert!(max - min > 15, "range {min}..{max}");
    }

    #[test]
    fn sharpen_leaves_flat_regions_unchanged() {
        let img = RgbImage::from_pixel(8, 8, Rgb([90, 90, 90]));
        let StepOutcome::Applied(out) = sharpen(&img).unwrap() else {
            panic!("expected applied");
        };
        assert_eq!(out.get_pixel(4, 4), &Rgb([90, 90, 90]));
    }

    #[test]
    fn sharpen_boosts_edges() {
        let img = RgbImage::from_fn(8, 8, |x, _| if x < 4 { Rgb([100, 100, 100]) } else { Rgb([160, 160, 160]) });
        let StepOutcome::Applied(out) = sharpen(&img).unwrap() else {
            panic!("expected applied");
        };
        assert!(out.get_pixel(3, 4)[0] < 100);
        assert!(out.get_pixel(4, 4)[0] > 160);
        assert!(matches!(sharpen(&RgbImage::new(2, 8)).unwrap(), StepOutcome::Skipped(_)));
    }

    #[test]
    fn otsu_binarization_splits_ink_from_paper() {
        let img = RgbImage::from_fn(10, 10, |x, _| if x < 3 { Rgb([25, 25, 25]) } else { Rgb([230, 230, 230]) });
        let StepOutcome::Applied(out) = binarize(&img, BinarizationMode::Otsu, 21, 10).unwrap() else {
            panic!("expected applied");
        };
        assert_eq!(out.get_pixel(1, 5), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(8, 5), &Rgb([255, 255, 255]));
    }

    #[test]
    fn adaptive_threshold_marks_dark_bubble() {
        let mut gray = GrayImage::from_pixel(40, 40, Luma([220]));
        for y in 18..22 {
            for x in 18..22 {
                gray.put_pixel(x, y, Luma([30]));
            }
        }
        let bw = threshold_adaptive(&gray, 21, 10).unwrap();
        assert_eq!(bw.get_pixel(20, 20)[0], 0);
        assert_eq!(bw.get_pixel(2, 2)[0], 255);
        assert!(threshold_adaptive(&gray, 20, 10).is_err());
    }

    #[test]
    fn full_pipeline_records_steps() {
        let sheet = sheet_from(DynamicImage::ImageRgb8(tilted_sheet()));
        let out = preprocess_blocking(&sheet, &PreprocessOptions::default()).unwrap();
        assert_eq!(out.media_type(), MediaType::Png);
        let steps = out.steps();
        assert_eq!(steps.first().map(String::as_str), Some("zoom_2x"));
        assert!(steps.iter().any(|s| s == "threshold_otsu"));
        assert!(!out.report().warnings.is_empty(), "300px photo should warn");
        assert!(image::load_from_memory(out.bytes()).is_ok());
    }

    #[test]
    fn tiny_image_never_fails() {
        let sheet = sheet_from(DynamicImage::ImageRgb8(RgbImage::new(1, 1)));
        let out = preprocess_blocking(&sheet, &PreprocessOptions::default()).unwrap();
        assert!(out.steps().contains(&"zoom_2x".to_string()));
        assert_eq!(out.dimensions(), (2, 2));
    }

    #[test]
    fn disabled_pipeline_forwards_original() {
        let sheet = sheet_from(DynamicImage::ImageRgb8(RgbImage::new(5, 5)));
        let opts = PreprocessOptions {
            enabled: false,
            ..Default::default()
        };
        let out = preprocess_blocking(&sheet, &opts).unwrap();
        assert!(out.steps().is_empty());
        assert_eq!(out.bytes(), sheet.bytes());
    }

    #[tokio::test]
    async fn async_preprocess_runs_on_blocking_pool() {
        let sheet = sheet_from(DynamicImage::ImageRgb8(RgbImage::new(8, 8)));
        let out = preprocess(sheet, &PreprocessOptions::default()).await.unwrap();
        assert_eq!(out.dimensions(), (16, 16));
    }
}
