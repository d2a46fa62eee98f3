//! Cutting source units into one file per card.
//!
//! Rendered pages are split into a fixed grid; positioned fragments are
//! grouped by the spatial aggregator. Either way each card lands in the
//! unit's work directory as `<serial>.<ext>`, with serials counting from 1
//! across all pages of the unit.

use std::sync::Arc;

use image::{RgbImage, imageops};

use crate::{
    aggregate::partition_fragments,
    async_utils::run_blocking,
    config::LayoutConfig,
    fragments::load_document_fragments,
    prelude::*,
    render::{PageSource, content_pages},
    source::SourceUnit,
};

/// A rectangle of a page, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// The grid cells of a `width` x `height` page, in row-major order, already
/// shrunk by the cell padding.
pub fn grid_cells(
    width: u32,
    height: u32,
    layout: &LayoutConfig,
) -> impl Iterator<Item = CellRect> + use<> {
    let header = (f64::from(height) * layout.header_fraction) as u32;
    let footer = (f64::from(height) * layout.footer_fraction) as u32;
    let content_height = height.saturating_sub(header + footer);
    let row_height = content_height / layout.rows;
    let col_width = width / layout.columns;
    let (rows, columns, pad) = (layout.rows, layout.columns, layout.cell_padding);

    (0..rows).flat_map(move |row| {
        (0..columns).filter_map(move |col| {
            let left = col * col_width + pad;
            let top = header + row * row_height + pad;
            let right = ((col + 1) * col_width).min(width).saturating_sub(pad);
            let bottom = (header + (row + 1) * row_height)
                .min(height)
                .saturating_sub(pad);
            (right > left && bottom > top).then(|| CellRect {
                x: left,
                y: top,
                width: right - left,
                height: bottom - top,
            })
        })
    })
}

/// Is this cell (nearly) empty paper?
///
/// We only look at an evenly spaced sample of pixels, which is plenty to
/// tell a printed card from a blank slot.
pub fn is_blank_cell(page: &RgbImage, cell: CellRect, layout: &LayoutConfig) -> bool {
    let total = u64::from(cell.width) * u64::from(cell.height);
    if total == 0 {
        return true;
    }
    let sample = (layout.blank_sample_size as u64).min(total);
    let step = total / sample;
    let brightness_sum: f64 = (0..sample)
        .map(|i| {
            let idx = i * step;
            let x = cell.x + (idx % u64::from(cell.width)) as u32;
            let y = cell.y + (idx / u64::from(cell.width)) as u32;
            let [r, g, b] = page.get_pixel(x, y).0;
            (f64::from(r) + f64::from(g) + f64::from(b)) / 3.0
        })
        .sum();
    brightness_sum / sample as f64 > layout.blank_threshold
}

/// Lazily crop the non-blank cells of a page, in row-major order.
pub fn segment_page<'a>(
    page: &'a RgbImage,
    layout: &'a LayoutConfig,
) -> impl Iterator<Item = RgbImage> + 'a {
    grid_cells(page.width(), page.height(), layout)
        .filter(move |&cell| !is_blank_cell(page, cell, layout))
        .map(move |cell| {
            imageops::crop_imm(page, cell.x, cell.y, cell.width, cell.height).to_image()
        })
}

/// Write the cards of one page to `dest`, numbering on from `serial`.
/// Returns the last serial used.
fn write_page_cards(
    page: &RgbImage,
    layout: &LayoutConfig,
    dest: &Path,
    mut serial: usize,
) -> Result<usize> {
    for card in segment_page(page, layout) {
        serial += 1;
        let path = dest.join(format!("{serial}.png"));
        card.save(&path)
            .with_context(|| format!("failed to write card {:?}", path))?;
    }
    Ok(serial)
}

/// What segmentation produced for one unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnitSegments {
    /// Number of cards written.
    pub count: usize,
    /// Number of pages in the unit.
    pub pages: usize,
}

/// Something that can cut a source unit into cards.
#[async_trait]
pub trait Segmenter: Send + Sync + 'static {
    /// Write the cards of `unit` into `dest`, replacing anything already
    /// there. Any failure means the unit's cards can't be trusted, so callers
    /// should treat an error as "no cards".
    async fn segment_unit(&self, unit: &SourceUnit, dest: &Path) -> Result<UnitSegments>;
}

/// Empty out `dest`, creating it if needed.
async fn reset_dir(dest: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dest).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to clear {:?}", dest));
        }
    }
    tokio::fs::create_dir_all(dest)
        .await
        .with_context(|| format!("failed to create {:?}", dest))
}

/// Segments rendered pages into a grid of card images.
pub struct ImageSegmenter {
    pages: Arc<dyn PageSource>,
    layout: LayoutConfig,
}

impl ImageSegmenter {
    pub fn new(pages: Arc<dyn PageSource>, layout: LayoutConfig) -> Self {
        Self { pages, layout }
    }
}

#[async_trait]
impl Segmenter for ImageSegmenter {
    #[instrument(level = "debug", skip_all, fields(unit = %unit.id))]
    async fn segment_unit(&self, unit: &SourceUnit, dest: &Path) -> Result<UnitSegments> {
        reset_dir(dest).await?;
        let (kind, page_count) = self.pages.page_count(unit).await?;

        let mut serial = 0;
        for page_idx in content_pages(kind, page_count, &self.layout) {
            let page = self
                .pages
                .render_page(unit, page_idx)
                .await
                .with_context(|| format!("failed to render page {}", page_idx + 1))?;
            let layout = self.layout.clone();
            let dest = dest.to_owned();
            serial = run_blocking(move || {
                write_page_cards(&page.into_rgb8(), &layout, &dest, serial)
            })
            .await?;
        }
        debug!(cards = serial, pages = page_count, "Segmented unit");
        Ok(UnitSegments {
            count: serial,
            pages: page_count,
        })
    }
}

/// Groups extraction-service fragments into one JSON file per record.
pub struct FragmentSegmenter {
    layout: LayoutConfig,
}

impl FragmentSegmenter {
    pub fn new(layout: LayoutConfig) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl Segmenter for FragmentSegmenter {
    #[instrument(level = "debug", skip_all, fields(unit = %unit.id))]
    async fn segment_unit(&self, unit: &SourceUnit, dest: &Path) -> Result<UnitSegments> {
        reset_dir(dest).await?;
        let fragments = load_document_fragments(&unit.path).await?;
        let pages = fragments.iter().map(|f| f.page + 1).max().unwrap_or(0);
        let groups = partition_fragments(fragments, &self.layout);
        for (idx, group) in groups.iter().enumerate() {
            let path = dest.join(format!("{}.json", idx + 1));
            let json = serde_json::to_vec(group).context("failed to serialize record")?;
            tokio::fs::write(&path, json)
                .await
                .with_context(|| format!("failed to write {:?}", path))?;
        }
        debug!(cards = groups.len(), pages, "Grouped fragments");
        Ok(UnitSegments {
            count: groups.len(),
            pages,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use image::{DynamicImage, Rgb};

    use super::*;
    use crate::render::DocumentKind;

    /// Page size that divides evenly under the default layout: a 35 px
    /// header, 25 px footer and 94 px rows.
    pub const PAGE_WIDTH: u32 = 300;
    pub const PAGE_HEIGHT: u32 = 1000;

    /// Draw a 3x10 page where every cell is printed except `blanks`
    /// (row-major cell numbers starting at 0).
    pub fn synthetic_page(blanks: &[u32]) -> RgbImage {
        let layout = LayoutConfig::default();
        let mut page = RgbImage::from_pixel(PAGE_WIDTH, PAGE_HEIGHT, Rgb([255, 255, 255]));
        for (idx, cell) in grid_cells(PAGE_WIDTH, PAGE_HEIGHT, &layout).enumerate() {
            if blanks.contains(&(idx as u32)) {
                continue;
            }
            // Shade each card differently so crops can be told apart.
            let shade = 40 + idx as u8;
            for y in cell.y..cell.y + cell.height {
                for x in cell.x..cell.x + cell.width {
                    page.put_pixel(x, y, Rgb([shade, shade, shade]));
                }
            }
        }
        page
    }

    #[test]
    fn grid_covers_content_band() {
        let cells = grid_cells(PAGE_WIDTH, PAGE_HEIGHT, &LayoutConfig::default())
            .collect::<Vec<_>>();
        assert_eq!(cells.len(), 30);
        assert_eq!(cells[0], CellRect { x: 1, y: 36, width: 98, height: 92 });
        assert_eq!(cells[1].x, 101);
        assert_eq!(cells[3].y, 35 + 94 + 1);
        assert!(cells[29].y + cells[29].height <= PAGE_HEIGHT - 25);
    }

    #[test]
    fn blank_cells_are_skipped_and_numbering_stays_contiguous() {
        let layout = LayoutConfig::default();
        let page = synthetic_page(&[4, 17]);
        let cards = segment_page(&page, &layout).collect::<Vec<_>>();
        assert_eq!(cards.len(), 28);

        // Card shades follow row-major order with cells 4 and 17 missing.
        let shades = cards.iter().map(|c| c.get_pixel(0, 0).0[0]).collect::<Vec<_>>();
        let expected = (0u8..30)
            .filter(|idx| *idx != 4 && *idx != 17)
            .map(|idx| 40 + idx)
            .collect::<Vec<_>>();
        assert_eq!(shades, expected);
    }

    #[test]
    fn segmentation_is_deterministic() {
        let layout = LayoutConfig::default();
        let page = synthetic_page(&[0, 29]);
        let first = segment_page(&page, &layout).collect::<Vec<_>>();
        let second = segment_page(&page, &layout).collect::<Vec<_>>();
        assert_eq!(first, second);
    }

    #[test]
    fn light_grey_cells_count_as_blank() {
        let layout = LayoutConfig::default();
        let page = RgbImage::from_pixel(PAGE_WIDTH, PAGE_HEIGHT, Rgb([253, 253, 253]));
        assert_eq!(segment_page(&page, &layout).count(), 0);
        let page = RgbImage::from_pixel(PAGE_WIDTH, PAGE_HEIGHT, Rgb([250, 250, 250]));
        assert_eq!(segment_page(&page, &layout).count(), 30);
    }

    /// Serves the same synthetic page for every page of a fake PDF, failing
    /// on request.
    struct FakePages {
        page_count: usize,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl PageSource for FakePages {
        async fn page_count(&self, _unit: &SourceUnit) -> Result<(DocumentKind, usize)> {
            Ok((DocumentKind::Pdf, self.page_count))
        }

        async fn render_page(&self, _unit: &SourceUnit, page: usize) -> Result<DynamicImage> {
            if Some(page) == self.fail_on {
                bail!("corrupt page");
            }
            Ok(DynamicImage::ImageRgb8(synthetic_page(&[4, 17])))
        }
    }

    #[tokio::test]
    async fn serials_continue_across_pages() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("segment")?;
        let dest = dir.path().join("unit");
        // Pages 3 and 4 of 6 are content pages.
        let segmenter = ImageSegmenter::new(
            Arc::new(FakePages {
                page_count: 6,
                fail_on: None,
            }),
            LayoutConfig::default(),
        );
        let unit = SourceUnit {
            id: "unit".to_owned(),
            ordinal: 0,
            path: dir.path().join("unit.pdf"),
        };
        let segments = segmenter.segment_unit(&unit, &dest).await?;
        assert_eq!(segments, UnitSegments { count: 56, pages: 6 });
        assert!(dest.join("1.png").exists());
        assert!(dest.join("56.png").exists());
        assert!(!dest.join("57.png").exists());
        Ok(())
    }

    #[tokio::test]
    async fn page_failures_fail_the_unit() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("segment")?;
        let segmenter = ImageSegmenter::new(
            Arc::new(FakePages {
                page_count: 6,
                fail_on: Some(4),
            }),
            LayoutConfig::default(),
        );
        let unit = SourceUnit {
            id: "unit".to_owned(),
            ordinal: 0,
            path: dir.path().join("unit.pdf"),
        };
        assert!(segmenter.segment_unit(&unit, &dir.path().join("unit")).await.is_err());
        Ok(())
    }
}
