//! Rasterizing the pages of a source unit.
//!
//! PDFs are rendered one page at a time with Poppler's `pdftocairo`, so a
//! single corrupt page fails on its own. Image files are a single page.

use std::{collections::BTreeMap, ops::Range, sync::LazyLock};

use image::DynamicImage;
use regex::Regex;

use crate::{
    async_utils::{check_for_command_failure, run_blocking, tool_command},
    config::LayoutConfig,
    cpu_limit::with_cpu_semaphore,
    prelude::*,
    source::SourceUnit,
};

/// Image types we decode directly.
const SUPPORTED_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg"];

/// PDF MIME type.
const PDF_MIME_TYPE: &str = "application/pdf";

/// Poppler prints "Syntax Error" for recoverable damage, so we only treat a
/// few messages as fatal.
static POPPLER_ERROR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(couldn't open|may not be a pdf|command line error)")
        .expect("failed to compile regex")
});

/// The kind of document a source unit is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Image,
}

/// Something that can rasterize the pages of a source unit.
#[async_trait]
pub trait PageSource: Send + Sync + 'static {
    /// Identify the document and count its pages.
    async fn page_count(&self, unit: &SourceUnit) -> Result<(DocumentKind, usize)>;

    /// Render one zero-based page.
    async fn render_page(&self, unit: &SourceUnit, page: usize) -> Result<DynamicImage>;
}

/// Pages that actually hold cards. PDF rolls start with cover and summary
/// pages and end with a summary page; standalone images are all content.
pub fn content_pages(kind: DocumentKind, page_count: usize, layout: &LayoutConfig) -> Range<usize> {
    match kind {
        DocumentKind::Image => 0..page_count,
        DocumentKind::Pdf => {
            let end = page_count.saturating_sub(layout.skip_trailing_pages);
            let start = layout.skip_leading_pages.min(end);
            start..end
        }
    }
}

/// A [`PageSource`] using Poppler for PDFs and `image` for image files.
pub struct PopplerRenderer {
    dpi: u32,
}

impl PopplerRenderer {
    /// Create a renderer producing pages at `dpi`.
    pub fn new(dpi: u32) -> Self {
        Self { dpi }
    }
}

#[async_trait]
impl PageSource for PopplerRenderer {
    #[instrument(level = "debug", skip_all, fields(unit = %unit.id))]
    async fn page_count(&self, unit: &SourceUnit) -> Result<(DocumentKind, usize)> {
        let mime_type = get_mime_type(&unit.path)?;
        if mime_type == PDF_MIME_TYPE {
            Ok((DocumentKind::Pdf, get_pdf_page_count(&unit.path).await?))
        } else if SUPPORTED_IMAGE_TYPES.contains(&mime_type.as_str()) {
            Ok((DocumentKind::Image, 1))
        } else {
            Err(anyhow!(
                "unsupported MIME type {} for {:?} (supported: PNG, JPEG, PDF)",
                mime_type,
                unit.path.display()
            ))
        }
    }

    #[instrument(level = "debug", skip_all, fields(unit = %unit.id, page = page))]
    async fn render_page(&self, unit: &SourceUnit, page: usize) -> Result<DynamicImage> {
        let mime_type = get_mime_type(&unit.path)?;
        if mime_type != PDF_MIME_TYPE {
            if page != 0 {
                bail!("{:?} is a single image and has no page {}", unit.path, page);
            }
            return load_image(unit.path.clone()).await;
        }

        let tmpdir = tempfile::TempDir::with_prefix("page")?;
        let out_base = tmpdir.path().join("page");
        // Poppler page numbers are 1-based and inclusive.
        let page_arg = (page + 1).to_string();
        let mut cmd = tool_command("pdftocairo");
        cmd.arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-f")
            .arg(&page_arg)
            .arg("-l")
            .arg(&page_arg)
            .arg("-singlefile")
            .arg(&unit.path)
            .arg(&out_base);

        // `pdftocairo` uses at least a full core, so don't start hundreds.
        let output = with_cpu_semaphore(|| async {
            cmd.output().await.with_context(|| {
                format!("failed to run pdftocairo on {:?}", unit.path.display())
            })
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, Some(&POPPLER_ERROR_REGEX))?;

        let image = load_image(out_base.with_extension("png")).await?;
        drop(tmpdir);
        Ok(image)
    }
}

/// Decode an image file on the blocking pool.
pub async fn load_image(path: PathBuf) -> Result<DynamicImage> {
    run_blocking(move || {
        image::open(&path).with_context(|| format!("failed to decode image {:?}", path))
    })
    .await
}

/// Get the number of pages in a PDF file using `pdfinfo`.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let output = tool_command("pdfinfo")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    // Parse the output of pdfinfo into properties.
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    let properties = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();

    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str.parse::<usize>().with_context(|| {
        format!(
            "failed to parse page count for {:?} from pdfinfo output",
            path.display()
        )
    })
}

/// Get the MIME type of a file from its contents.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}
