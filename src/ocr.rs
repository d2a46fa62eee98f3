//! Turning cards into field values.
//!
//! A [`TextRecognizer`] reads the text of an image. A [`CardRecognizer`]
//! produces [`CardFields`] for one card file written by segmentation, and
//! knows how to have another go at cards with gaps.

use std::sync::Arc;

use image::{DynamicImage, ImageFormat};

use crate::{
    aggregate::FragmentGroup,
    async_utils::{check_for_command_failure, run_blocking, tool_command},
    config::LayoutConfig,
    cpu_limit::with_cpu_permits,
    parser::parse_card,
    prelude::*,
    record::{CardFields, Field},
    render::load_image,
    repair::repair_fields,
};

/// Reads the text in an image.
#[async_trait]
pub trait TextRecognizer: Send + Sync + 'static {
    async fn recognize_text(&self, image: DynamicImage) -> Result<String>;
}

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractRecognizer {
    /// Tesseract language list, like `tam+eng`.
    lang: String,
    /// How many threads each `tesseract` process may use.
    threads: usize,
}

impl TesseractRecognizer {
    pub fn new(lang: impl Into<String>, threads: usize) -> Self {
        Self {
            lang: lang.into(),
            threads: threads.max(1),
        }
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    #[instrument(level = "trace", skip_all)]
    async fn recognize_text(&self, image: DynamicImage) -> Result<String> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let output_path = tmpdir.path().join("output.txt");
        {
            let input_path = input_path.clone();
            run_blocking(move || {
                image
                    .save_with_format(&input_path, ImageFormat::Png)
                    .context("cannot write tesseract input file")
            })
            .await?;
        }

        // Each process gets its own thread budget, so that `jobs` processes
        // never use more cores than we validated at startup.
        let output = with_cpu_permits(self.threads, || async {
            tool_command("tesseract")
                .arg(&input_path)
                .arg(output_path.with_extension(""))
                .arg("-l")
                .arg(&self.lang)
                .arg("--psm")
                .arg("6")
                .arg("--oem")
                .arg("1")
                .env("OMP_THREAD_LIMIT", self.threads.to_string())
                .kill_on_drop(true)
                .output()
                .await
                .context("cannot run tesseract")
        })
        .await?;
        check_for_command_failure("tesseract", &output, None)?;

        tokio::fs::read_to_string(&output_path)
            .await
            .context("cannot read tesseract output file")
    }
}

/// One card written by segmentation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CardRef {
    /// Global index of this card within the run.
    pub index: usize,
    /// Identifier of the source unit.
    pub unit_id: String,
    /// Position within the unit, starting at 1.
    pub serial: usize,
    /// The card file.
    pub path: PathBuf,
}

/// Extracts fields from card files.
#[async_trait]
pub trait CardRecognizer: Send + Sync + 'static {
    /// Extract whatever fields we can from a card.
    async fn recognize(&self, card: &CardRef) -> Result<CardFields>;

    /// Try harder to find `targets`, starting from `fields`.
    async fn repair(
        &self,
        card: &CardRef,
        fields: CardFields,
        targets: &[Field],
    ) -> Result<CardFields>;
}

/// Recognizes card images with OCR.
pub struct ImageCardRecognizer {
    text: Arc<dyn TextRecognizer>,
    layout: LayoutConfig,
}

impl ImageCardRecognizer {
    pub fn new(text: Arc<dyn TextRecognizer>, layout: LayoutConfig) -> Self {
        Self { text, layout }
    }
}

#[async_trait]
impl CardRecognizer for ImageCardRecognizer {
    #[instrument(level = "debug", skip_all, fields(unit = %card.unit_id, serial = card.serial))]
    async fn recognize(&self, card: &CardRef) -> Result<CardFields> {
        let image = load_image(card.path.clone()).await?;
        let text = self.text.recognize_text(image).await?;
        Ok(parse_card(&text))
    }

    #[instrument(level = "debug", skip_all, fields(unit = %card.unit_id, serial = card.serial))]
    async fn repair(
        &self,
        card: &CardRef,
        fields: CardFields,
        targets: &[Field],
    ) -> Result<CardFields> {
        let image = load_image(card.path.clone()).await?;
        repair_fields(self.text.as_ref(), &image, fields, targets, &self.layout).await
    }
}

/// Reads the fragment groups written by [`crate::segment::FragmentSegmenter`].
pub struct FragmentCardRecognizer;

#[async_trait]
impl CardRecognizer for FragmentCardRecognizer {
    async fn recognize(&self, card: &CardRef) -> Result<CardFields> {
        let json = tokio::fs::read(&card.path)
            .await
            .with_context(|| format!("failed to read {:?}", card.path))?;
        let group: FragmentGroup = serde_json::from_slice(&json)
            .with_context(|| format!("failed to parse {:?}", card.path))?;
        Ok(group.to_fields())
    }

    /// Fragments have no pixels to enhance, so there is nothing more to try.
    async fn repair(
        &self,
        _card: &CardRef,
        fields: CardFields,
        _targets: &[Field],
    ) -> Result<CardFields> {
        Ok(fields)
    }
}
