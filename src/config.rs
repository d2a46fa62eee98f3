//! Page layout and resource configuration.
//!
//! The defaults describe the standard three-column, ten-row roll template.
//! Other templates can be described in a TOML or JSON file passed with
//! `--layout`.

use crate::{async_utils::io::read_json_or_toml, prelude::*};

/// Geometry of a roll page, plus the constants used to interpret it.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutConfig {
    /// Number of card rows on a page.
    pub rows: u32,
    /// Number of card columns on a page.
    pub columns: u32,
    /// Fraction of the page height taken by the page header.
    pub header_fraction: f64,
    /// Fraction of the page height taken by the page footer.
    pub footer_fraction: f64,
    /// Pixels trimmed from every side of a cell, to avoid bleed from
    /// neighboring cells.
    pub cell_padding: u32,
    /// Mean brightness (0-255) above which a cell counts as blank.
    pub blank_threshold: f64,
    /// Maximum number of pixels sampled when checking for blank cells.
    pub blank_sample_size: usize,
    /// Pages skipped at the start of each PDF (cover and summary pages).
    pub skip_leading_pages: usize,
    /// Pages skipped at the end of each PDF.
    pub skip_trailing_pages: usize,
    /// Rendering resolution for PDF pages.
    pub render_dpi: u32,
    /// Horizontal bucket boundaries for positioned fragments, ascending.
    pub column_thresholds: Vec<f64>,
    /// Initial height of a record seeded from an identifier fragment.
    pub anchor_span: f64,
    /// How far above or below a record start a fragment may sit and still be
    /// assigned to that record.
    pub anchor_tolerance: f64,
    /// Where the age and gender band starts, as a fraction of card height.
    pub repair_crop_top: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            rows: 10,
            columns: 3,
            header_fraction: 0.035,
            footer_fraction: 0.025,
            cell_padding: 1,
            blank_threshold: 252.0,
            blank_sample_size: 100,
            skip_leading_pages: 3,
            skip_trailing_pages: 1,
            render_dpi: 108,
            column_thresholds: vec![0.33, 0.66],
            anchor_span: 0.10,
            anchor_tolerance: 0.12,
            repair_crop_top: 0.65,
        }
    }
}

impl LayoutConfig {
    /// Load a layout from `path`, or use the default layout.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let layout = match path {
            Some(path) => read_json_or_toml::<LayoutConfig>(path)
                .await
                .with_context(|| format!("failed to load layout from {:?}", path))?,
            None => LayoutConfig::default(),
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Check that this layout describes a usable page.
    pub fn validate(&self) -> Result<()> {
        if self.rows == 0 || self.columns == 0 {
            bail!("layout must have at least one row and one column");
        }
        let margins = self.header_fraction + self.footer_fraction;
        if self.header_fraction < 0.0 || self.footer_fraction < 0.0 || margins >= 1.0 {
            bail!("header and footer fractions must be non-negative and leave room for content");
        }
        if !self
            .column_thresholds
            .windows(2)
            .all(|pair| pair[0] < pair[1])
        {
            bail!("column thresholds must be strictly ascending");
        }
        if self.anchor_span <= 0.0 || self.anchor_tolerance < 0.0 {
            bail!("anchor span must be positive and tolerance non-negative");
        }
        if !(0.0..1.0).contains(&self.repair_crop_top) {
            bail!("repair crop must start inside the card");
        }
        if self.blank_sample_size == 0 {
            bail!("blank sample size must be at least 1");
        }
        Ok(())
    }

    /// Which column bucket does a normalized `x` coordinate fall into?
    pub fn column_of(&self, x: f64) -> usize {
        self.column_thresholds
            .iter()
            .position(|&threshold| x < threshold)
            .unwrap_or(self.column_thresholds.len())
    }
}

/// Check that `jobs` workers, each allowing `threads_per_job` OCR threads,
/// fit on this machine.
///
/// Oversubscribing cores makes the whole machine stall, so we refuse to start
/// rather than discover it hours later.
pub fn check_thread_budget(jobs: usize, threads_per_job: usize, cores: usize) -> Result<()> {
    if jobs == 0 || threads_per_job == 0 {
        bail!("--jobs and --ocr-threads must be at least 1");
    }
    let wanted = jobs.saturating_mul(threads_per_job);
    if wanted > cores {
        bail!(
            "{jobs} jobs x {threads_per_job} OCR threads = {wanted} threads, but only \
             {cores} cores are available; lower --jobs or --ocr-threads"
        );
    }
    Ok(())
}

/// Default job count: as many workers as fit in the core budget.
pub fn default_job_count(threads_per_job: usize, cores: usize) -> usize {
    (cores / threads_per_job.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid() {
        LayoutConfig::default().validate().unwrap();
    }

    #[test]
    fn column_buckets_follow_thresholds() {
        let layout = LayoutConfig::default();
        assert_eq!(layout.column_of(0.0), 0);
        assert_eq!(layout.column_of(0.3299), 0);
        assert_eq!(layout.column_of(0.33), 1);
        assert_eq!(layout.column_of(0.65), 1);
        assert_eq!(layout.column_of(0.66), 2);
        assert_eq!(layout.column_of(1.0), 2);
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let layout = LayoutConfig {
            column_thresholds: vec![0.66, 0.33],
            ..LayoutConfig::default()
        };
        assert!(layout.validate().is_err());
    }

    #[tokio::test]
    async fn partial_toml_layout_keeps_defaults() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("layout")?;
        let path = dir.path().join("layout.toml");
        tokio::fs::write(&path, "rows = 8\ncolumns = 2\n").await?;
        let layout = LayoutConfig::load(Some(&path)).await?;
        assert_eq!(layout.rows, 8);
        assert_eq!(layout.columns, 2);
        assert_eq!(layout.anchor_span, 0.10);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_layout_keys_are_errors() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("layout")?;
        let path = dir.path().join("layout.toml");
        tokio::fs::write(&path, "rowz = 8\n").await?;
        assert!(LayoutConfig::load(Some(&path)).await.is_err());
        Ok(())
    }

    #[test]
    fn thread_budget_rejects_oversubscription() {
        assert!(check_thread_budget(4, 2, 8).is_ok());
        assert!(check_thread_budget(4, 3, 8).is_err());
        assert!(check_thread_budget(0, 1, 8).is_err());
        assert_eq!(default_job_count(2, 8), 4);
        assert_eq!(default_job_count(16, 8), 1);
    }
}
