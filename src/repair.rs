//! Second-chance recognition for cards with missing fields.
//!
//! We try a short, fixed list of image enhancements, one after another, and
//! stop as soon as every field we were looking for has been found.

use image::{DynamicImage, GrayImage, Luma, imageops::FilterType};

use crate::{
    config::LayoutConfig,
    ocr::TextRecognizer,
    parser::parse_card,
    prelude::*,
    record::{CardFields, Field},
};

/// Contrast multiplier for [`Enhancement::Contrast`].
const CONTRAST_FACTOR: f32 = 2.0;
/// Pixels darker than this become black in [`Enhancement::Binarize`].
const BINARIZE_THRESHOLD: u8 = 140;
/// Scale factor for [`Enhancement::Upscale`].
const UPSCALE_FACTOR: u32 = 2;

/// One way of cleaning up a card image before trying OCR again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enhancement {
    /// Stretch grey levels away from the mean.
    Contrast,
    /// Threshold to pure black and white.
    Binarize,
    /// Enlarge, so small print has more pixels.
    Upscale,
}

impl Enhancement {
    /// Every enhancement, in the order we try them.
    pub const ALL: [Enhancement; 3] = [
        Enhancement::Contrast,
        Enhancement::Binarize,
        Enhancement::Upscale,
    ];

    /// Apply this enhancement, returning a new image.
    pub fn apply(self, image: &DynamicImage) -> DynamicImage {
        match self {
            Enhancement::Contrast => DynamicImage::ImageLuma8(boost_contrast(
                &image.to_luma8(),
                CONTRAST_FACTOR,
            )),
            Enhancement::Binarize => {
                let mut gray = image.to_luma8();
                for pixel in gray.pixels_mut() {
                    pixel.0[0] = if pixel.0[0] < BINARIZE_THRESHOLD { 0 } else { 255 };
                }
                DynamicImage::ImageLuma8(gray)
            }
            Enhancement::Upscale => image.resize_exact(
                image.width() * UPSCALE_FACTOR,
                image.height() * UPSCALE_FACTOR,
                FilterType::Lanczos3,
            ),
        }
    }
}

/// Push every pixel away from the mean grey level by `factor`.
fn boost_contrast(gray: &GrayImage, factor: f32) -> GrayImage {
    let count = u64::from(gray.width()) * u64::from(gray.height());
    if count == 0 {
        return gray.clone();
    }
    let sum: u64 = gray.pixels().map(|p| u64::from(p.0[0])).sum();
    let mean = (sum as f32 / count as f32).round();
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let value = f32::from(gray.get_pixel(x, y).0[0]);
        Luma([(mean + factor * (value - mean)).clamp(0.0, 255.0) as u8])
    })
}

/// The part of a card worth re-reading for `targets`. Age and gender sit in
/// the bottom band, so when those are all we need we skip the rest.
pub fn repair_region(
    card: &DynamicImage,
    targets: &[Field],
    layout: &LayoutConfig,
) -> DynamicImage {
    if targets.is_empty() || !targets.iter().all(|f| f.in_lower_band()) {
        return card.clone();
    }
    let top = (f64::from(card.height()) * layout.repair_crop_top) as u32;
    if top >= card.height() {
        return card.clone();
    }
    card.crop_imm(0, top, card.width(), card.height() - top)
}

/// Retry recognition of `card` until none of `targets` is missing from
/// `fields`, or we run out of enhancements.
///
/// Anything else a pass happens to find also fills gaps, but never
/// overwrites a value we already have.
#[instrument(level = "debug", skip_all, fields(targets = ?targets))]
pub async fn repair_fields(
    recognizer: &dyn TextRecognizer,
    card: &DynamicImage,
    mut fields: CardFields,
    targets: &[Field],
    layout: &LayoutConfig,
) -> Result<CardFields> {
    let missing = fields.missing(targets);
    if missing.is_empty() {
        return Ok(fields);
    }
    let region = repair_region(card, &missing, layout);

    for enhancement in Enhancement::ALL {
        let enhanced = enhancement.apply(&region);
        let text = recognizer.recognize_text(enhanced).await?;
        fields.fill_missing_from(&parse_card(&text));
        if fields.missing(&missing).is_empty() {
            debug!(?enhancement, "Repaired card");
            break;
        }
    }
    Ok(fields)
}
