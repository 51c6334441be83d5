//! Page classification.
//!
//! We look at a downscaled grayscale copy of each page and estimate a few
//! cheap structural signals. None of this needs to be very accurate: it only
//! decides which engines go first.

use std::sync::Arc;

use image::{DynamicImage, GrayImage};

use crate::{page::Page, prelude::*};

use super::{DocumentCategory, RoutingHint, UNKNOWN_LANGUAGE, lexicon::Lexicons};

/// We analyze pages at no more than this many pixels per side.
const MAX_ANALYSIS_SIDE: u32 = 1200;

/// Pages with less contrast than this between their darkest and lightest
/// pixels are blank.
const MIN_CONTRAST: u8 = 32;

/// Pages with less ink than this are blank.
const MIN_INK_RATIO: f32 = 0.002;

/// Ink ratio of a densely printed page.
const FULL_DENSITY_INK_RATIO: f32 = 0.12;

/// Confidence we report for blank or empty pages.
const BLANK_CONFIDENCE: f32 = 0.05;

/// A horizontal ink run this fraction of the page width is a ruling line.
const HORIZONTAL_RULE_FRACTION: f32 = 0.3;

/// A vertical ink run this fraction of the page height is a ruling line.
const VERTICAL_RULE_FRACTION: f32 = 0.15;

/// Pages with a table score at least this high are structured.
const MIN_TABLE_SCORE: f32 = 0.5;

/// Handwriting likelihood thresholds.
const HANDWRITTEN_LIKELIHOOD: f32 = 0.6;
const PRINTED_LIKELIHOOD: f32 = 0.35;

/// Skew search range and step, in degrees.
const MAX_SKEW_DEGREES: f32 = 5.0;
const SKEW_STEP_DEGREES: f32 = 0.5;

/// At most this many ink pixels are used to estimate skew.
const MAX_SKEW_SAMPLES: usize = 20_000;

/// Estimates a [`RoutingHint`] for a page. Never fails.
#[derive(Clone, Debug)]
pub struct Classifier {
    lexicons: Arc<Lexicons>,
    expected_chars_at_full_density: f32,
}

impl Classifier {
    /// Create a new classifier.
    pub fn new(lexicons: Arc<Lexicons>, expected_chars_at_full_density: f32) -> Self {
        Self {
            lexicons,
            expected_chars_at_full_density,
        }
    }

    /// Classify a page.
    #[instrument(level = "debug", skip_all, fields(page = page.index))]
    pub fn classify(&self, page: &Page) -> RoutingHint {
        let text = page.non_blank_embedded_text();
        let language = text
            .and_then(|text| self.lexicons.detect_language(text))
            .unwrap_or(UNKNOWN_LANGUAGE);

        let from_image = page.image.as_ref().and_then(classify_image);
        let mut hint = match (from_image, text) {
            (Some(hint), _) => hint,
            (None, Some(text)) => self.classify_text(text),
            (None, None) => RoutingHint::ambiguous(BLANK_CONFIDENCE),
        };
        hint.language = language.to_owned();

        debug!(
            category = %hint.category,
            confidence = hint.confidence,
            skew = hint.skew_degrees,
            language = %hint.language,
            density = hint.text_density,
            "Classified page"
        );
        hint
    }

    /// Born-digital pages: no pixels, just text.
    fn classify_text(&self, text: &str) -> RoutingHint {
        let lines = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>();
        let columnar = lines
            .iter()
            .filter(|line| line.contains('\t') || line.matches("   ").count() >= 2)
            .count();
        let (category, confidence) = if lines.len() >= 4 && columnar * 2 >= lines.len() {
            (DocumentCategory::Structured, 0.7)
        } else {
            (DocumentCategory::Printed, 0.9)
        };
        let chars = text.chars().filter(|c| !c.is_whitespace()).count();
        RoutingHint {
            category,
            confidence,
            skew_degrees: 0.0,
            language: UNKNOWN_LANGUAGE.to_owned(),
            text_density: (chars as f32 / self.expected_chars_at_full_density).min(1.0),
        }
    }
}

/// Classify a page image. Returns `None` for blank or degenerate images.
fn classify_image(image: &DynamicImage) -> Option<RoutingHint> {
    if image.width() == 0 || image.height() == 0 {
        return None;
    }
    let gray = if image.width().max(image.height()) > MAX_ANALYSIS_SIDE {
        image
            .thumbnail(MAX_ANALYSIS_SIDE, MAX_ANALYSIS_SIDE)
            .to_luma8()
    } else {
        image.to_luma8()
    };
    let ink = InkMap::from_gray(&gray)?;

    let ink_ratio = ink.count as f32 / ink.pixels.len() as f32;
    if ink_ratio < MIN_INK_RATIO {
        return None;
    }
    let text_density = (ink_ratio / FULL_DENSITY_INK_RATIO).min(1.0);
    let skew_degrees = ink.estimate_skew();

    let layout = ink.layout();
    let table_score = layout.table_score();
    let (category, confidence) = if table_score >= MIN_TABLE_SCORE {
        (DocumentCategory::Structured, (0.5 + 0.45 * table_score).min(0.95))
    } else {
        let likelihood = layout.handwriting_likelihood();
        trace!(table_score, likelihood, "Layout signals");
        if likelihood >= HANDWRITTEN_LIKELIHOOD {
            (DocumentCategory::Handwritten, likelihood.min(0.95))
        } else if likelihood <= PRINTED_LIKELIHOOD {
            (DocumentCategory::Printed, (1.0 - likelihood).min(0.95))
        } else {
            (DocumentCategory::Mixed, 0.4)
        }
    };

    Some(RoutingHint {
        category,
        confidence,
        skew_degrees,
        language: UNKNOWN_LANGUAGE.to_owned(),
        text_density,
    })
}

/// A binarized page. `true` is ink.
struct InkMap {
    width: usize,
    height: usize,
    pixels: Vec<bool>,
    count: usize,
}

impl InkMap {
    /// Binarize with Otsu's threshold. Returns `None` for flat images.
    fn from_gray(gray: &GrayImage) -> Option<Self> {
        let raw = gray.as_raw();
        let min = raw.iter().copied().min()?;
        let max = raw.iter().copied().max()?;
        if max - min < MIN_CONTRAST {
            return None;
        }
        let threshold = otsu_threshold(raw);
        let pixels = raw.iter().map(|p| *p <= threshold).collect::<Vec<_>>();
        let count = pixels.iter().filter(|p| **p).count();
        Some(Self {
            width: gray.width() as usize,
            height: gray.height() as usize,
            pixels,
            count,
        })
    }

    fn at(&self, x: usize, y: usize) -> bool {
        self.pixels[y * self.width + x]
    }

    /// Collect ink runs, ruling lines and text line bands.
    fn layout(&self) -> Layout {
        let min_h_rule = (self.width as f32 * HORIZONTAL_RULE_FRACTION).max(2.0) as usize;
        let min_v_rule = (self.height as f32 * VERTICAL_RULE_FRACTION).max(2.0) as usize;

        let mut run_lengths = vec![];
        let mut ruled_rows = vec![false; self.height];
        let mut row_has_text = vec![false; self.height];
        for (y, ruled) in ruled_rows.iter_mut().enumerate() {
            let mut text_runs = vec![];
            for run in runs((0..self.width).map(|x| self.at(x, y))) {
                if run >= min_h_rule {
                    *ruled = true;
                } else {
                    text_runs.push(run);
                }
            }
            row_has_text[y] = !*ruled && !text_runs.is_empty();
            run_lengths.extend(text_runs);
        }

        let mut ruled_columns = vec![false; self.width];
        for (x, ruled) in ruled_columns.iter_mut().enumerate() {
            *ruled = runs((0..self.height).map(|y| self.at(x, y))).any(|run| run >= min_v_rule);
        }

        let line_heights = runs(row_has_text.iter().copied())
            .filter(|height| *height >= 2)
            .collect();

        Layout {
            horizontal_rules: runs(ruled_rows.into_iter()).count(),
            vertical_rules: runs(ruled_columns.into_iter()).count(),
            run_lengths,
            line_heights,
        }
    }

    /// Find the angle whose projection profile has the sharpest peaks.
    fn estimate_skew(&self) -> f32 {
        let step = self.count.div_ceil(MAX_SKEW_SAMPLES).max(1);
        let samples = self
            .pixels
            .iter()
            .enumerate()
            .filter(|(_, ink)| **ink)
            .step_by(step)
            .map(|(i, _)| ((i % self.width) as f32, (i / self.width) as f32))
            .collect::<Vec<_>>();

        let margin = (self.width as f32 * MAX_SKEW_DEGREES.to_radians().tan()).ceil() as usize + 1;
        let bins = self.height + 2 * margin;
        let steps = (MAX_SKEW_DEGREES / SKEW_STEP_DEGREES).round() as i32;

        let mut best = (0.0f32, f64::MIN);
        let mut profile = vec![0u64; bins];
        for i in -steps..=steps {
            let angle = i as f32 * SKEW_STEP_DEGREES;
            let slope = angle.to_radians().tan();
            profile.iter_mut().for_each(|bin| *bin = 0);
            for (x, y) in &samples {
                let shifted = (y - x * slope).round() + margin as f32;
                let bin = (shifted.max(0.0) as usize).min(bins - 1);
                profile[bin] += 1;
            }
            // The sample count is fixed, so the sum of squares ranks
            // profiles the same way their variance would.
            let sharpness = profile.iter().map(|c| (*c * *c) as f64).sum::<f64>();
            if sharpness > best.1 {
                best = (angle, sharpness);
            }
        }
        best.0
    }
}

/// Structural measurements of a page.
struct Layout {
    horizontal_rules: usize,
    vertical_rules: usize,
    run_lengths: Vec<usize>,
    line_heights: Vec<usize>,
}

impl Layout {
    /// How much this looks like a ruled table or form, from 0.0 to 1.0.
    fn table_score(&self) -> f32 {
        let horizontal = (self.horizontal_rules as f32 / 3.0).min(1.0);
        let vertical = (self.vertical_rules as f32 / 2.0).min(1.0);
        horizontal * vertical
    }

    /// Printed text has regular strokes and line heights. Handwriting
    /// doesn't.
    fn handwriting_likelihood(&self) -> f32 {
        let strokes = coefficient_of_variation(&self.run_lengths)
            .map(|cv| normalize(cv, 0.6, 1.2))
            .unwrap_or(0.0);
        let lines = coefficient_of_variation(&self.line_heights)
            .map(|cv| normalize(cv, 0.15, 0.5))
            .unwrap_or(strokes);
        0.5 * strokes + 0.5 * lines
    }
}

/// Lengths of runs of `true`.
fn runs(values: impl Iterator<Item = bool>) -> impl Iterator<Item = usize> {
    let mut values = values.peekable();
    std::iter::from_fn(move || {
        while values.next_if(|v| !*v).is_some() {}
        let mut len = 0;
        while values.next_if(|v| *v).is_some() {
            len += 1;
        }
        (len > 0).then_some(len)
    })
}

/// Otsu's method: the threshold which maximizes between-class variance.
fn otsu_threshold(pixels: &[u8]) -> u8 {
    let mut histogram = [0u64; 256];
    for p in pixels {
        histogram[*p as usize] += 1;
    }
    let total = pixels.len() as f64;
    let sum_all = histogram
        .iter()
        .enumerate()
        .map(|(value, count)| value as f64 * *count as f64)
        .sum::<f64>();

    let (mut weight_bg, mut sum_bg) = (0.0, 0.0);
    let (mut best_threshold, mut best_variance) = (0u8, -1.0);
    for (value, count) in histogram.iter().enumerate() {
        weight_bg += *count as f64;
        if weight_bg == 0.0 {
            continue;
        }
        let weight_fg = total - weight_bg;
        if weight_fg == 0.0 {
            break;
        }
        sum_bg += value as f64 * *count as f64;
        let mean_bg = sum_bg / weight_bg;
        let mean_fg = (sum_all - sum_bg) / weight_fg;
        let variance = weight_bg * weight_fg * (mean_bg - mean_fg).powi(2);
        if variance > best_variance {
            best_variance = variance;
            best_threshold = value as u8;
        }
    }
    best_threshold
}

fn coefficient_of_variation(values: &[usize]) -> Option<f32> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<usize>() as f32 / n;
    if mean == 0.0 {
        return None;
    }
    let variance = values
        .iter()
        .map(|v| (*v as f32 - mean).powi(2))
        .sum::<f32>()
        / n;
    Some(variance.sqrt() / mean)
}

/// Map `value` from `[low, high]` onto `[0, 1]`, clamping.
fn normalize(value: f32, low: f32, high: f32) -> f32 {
    ((value - low) / (high - low)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    const WHITE: Luma<u8> = Luma([255]);
    const BLACK: Luma<u8> = Luma([0]);

    fn classifier() -> Classifier {
        Classifier::new(Arc::new(Lexicons::builtin()), 2500.0)
    }

    fn image_page(image: GrayImage) -> Page {
        Page::new(0, Some(DynamicImage::ImageLuma8(image)), None)
    }

    fn fill(image: &mut GrayImage, x0: u32, y0: u32, w: u32, h: u32) {
        for y in y0..(y0 + h).min(image.height()) {
            for x in x0..(x0 + w).min(image.width()) {
                image.put_pixel(x, y, BLACK);
            }
        }
    }

    /// Rows of identical "words", like a printed page.
    fn printed_page() -> GrayImage {
        let mut image = GrayImage::from_pixel(600, 400, WHITE);
        for line in 0..10 {
            for word in 0..10 {
                fill(&mut image, 20 + word * 55, 20 + line * 36, 40, 12);
            }
        }
        image
    }

    #[test]
    fn test_blank_page_is_mixed_with_low_confidence() {
        let hint = classifier().classify(&image_page(GrayImage::from_pixel(800, 600, WHITE)));
        assert_eq!(hint.category, DocumentCategory::Mixed);
        assert!(hint.confidence <= 0.1);
        assert_eq!(hint.language, UNKNOWN_LANGUAGE);

        // A single speck of dust is still blank.
        let mut speck = GrayImage::from_pixel(800, 600, WHITE);
        fill(&mut speck, 100, 100, 3, 3);
        let hint = classifier().classify(&image_page(speck));
        assert_eq!(hint.category, DocumentCategory::Mixed);
        assert!(hint.confidence <= 0.1);
    }

    #[test]
    fn test_empty_pages_never_fail() {
        let hint = classifier().classify(&Page::new(3, None, None));
        assert_eq!(hint, RoutingHint::ambiguous(BLANK_CONFIDENCE));

        let tiny = Page::new(0, Some(DynamicImage::new_luma8(0, 0)), Some("  ".to_owned()));
        assert_eq!(classifier().classify(&tiny).category, DocumentCategory::Mixed);
    }

    #[test]
    fn test_regular_text_is_printed() {
        let hint = classifier().classify(&image_page(printed_page()));
        assert_eq!(hint.category, DocumentCategory::Printed);
        assert!(hint.confidence > 0.5);
        assert!(hint.text_density > 0.0);
        assert_eq!(hint.skew_degrees, 0.0);
    }

    #[test]
    fn test_irregular_strokes_are_handwritten() {
        let mut image = GrayImage::from_pixel(600, 400, WHITE);
        let widths = [2, 45, 6, 70, 3, 25, 1, 55];
        let heights = [6, 30, 10, 24, 5];
        let mut y = 10;
        for (line, height) in heights.iter().enumerate() {
            let mut x = 10;
            for i in 0..widths.len() {
                let width = widths[(i + line) % widths.len()];
                fill(&mut image, x, y, width, *height);
                x += width + 12;
            }
            y += height + 20;
        }
        let hint = classifier().classify(&image_page(image));
        assert_eq!(hint.category, DocumentCategory::Handwritten, "{hint:?}");
    }

    #[test]
    fn test_ruled_grid_is_structured() {
        let mut image = GrayImage::from_pixel(600, 400, WHITE);
        for row in 0..5 {
            fill(&mut image, 50, 40 + row * 80, 500, 2);
        }
        for column in 0..4 {
            fill(&mut image, 50 + column * 166, 40, 2, 322);
        }
        let hint = classifier().classify(&image_page(image));
        assert_eq!(hint.category, DocumentCategory::Structured, "{hint:?}");
    }

    #[test]
    fn test_skew_is_estimated() {
        let slope = 3.0f32.to_radians().tan();
        let mut image = GrayImage::from_pixel(600, 400, WHITE);
        for line in 0..8 {
            for x in 0..600u32 {
                // Dashes, so the lines look like words and not rules.
                if x % 40 >= 30 {
                    continue;
                }
                let y = (20.0 + line as f32 * 40.0 + x as f32 * slope).round() as u32;
                fill(&mut image, x, y, 1, 3);
            }
        }
        let hint = classifier().classify(&image_page(image));
        assert!((hint.skew_degrees - 3.0).abs() <= 0.5, "{hint:?}");
    }

    #[test]
    fn test_text_only_pages() {
        let letter = Page::new(
            0,
            None,
            Some("Dear Sir,\nthank you for your letter of the first of May.".to_owned()),
        );
        let hint = classifier().classify(&letter);
        assert_eq!(hint.category, DocumentCategory::Printed);
        assert_eq!(hint.language, "en");
        assert!(hint.text_density > 0.0 && hint.text_density < 0.1);

        let table = Page::new(
            1,
            None,
            Some("Item\tQty\tPrice\nPaper\t2\t4.00\nInk\t1\t12.50\nTape\t3\t1.20\n".to_owned()),
        );
        assert_eq!(
            classifier().classify(&table).category,
            DocumentCategory::Structured
        );
    }

    #[test]
    fn test_otsu_and_runs() {
        assert_eq!(otsu_threshold(&[0, 0, 255, 255]), 0);
        assert_eq!(
            runs([true, true, false, true, false, false, true].into_iter()).collect::<Vec<_>>(),
            vec![2, 1, 1]
        );
    }
}
