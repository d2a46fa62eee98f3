//! Discovering the source units in an input folder.

use std::collections::BTreeSet;

use clap::ValueEnum;

use crate::prelude::*;

/// How cards are read from the source units.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Render PDFs or images, cut them into cards and OCR each card.
    Images,
    /// Read positioned fragments produced by a document-extraction service.
    Fragments,
}

impl InputMode {
    /// File extensions we pick up in this mode.
    fn extensions(self) -> &'static [&'static str] {
        match self {
            InputMode::Images => &["pdf", "png", "jpg", "jpeg"],
            InputMode::Fragments => &["json"],
        }
    }

    /// Extension of the per-card files written during segmentation.
    pub fn card_extension(self) -> &'static str {
        match self {
            InputMode::Images => "png",
            InputMode::Fragments => "json",
        }
    }
}

/// One input document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceUnit {
    /// Stable identifier, taken from the file stem.
    pub id: String,
    /// Position in the sorted list of units.
    pub ordinal: usize,
    pub path: PathBuf,
}

/// Find every source unit in `folder`, sorted by file name.
///
/// Two files with the same stem (say `part-1.pdf` and `part-1.png`) would
/// share a work directory, so that's an error.
#[instrument(level = "debug", skip_all, fields(folder = %folder.display()))]
pub async fn discover_units(folder: &Path, mode: InputMode) -> Result<Vec<SourceUnit>> {
    let mut entries = tokio::fs::read_dir(folder)
        .await
        .with_context(|| format!("failed to read input folder {:?}", folder))?;

    let mut paths = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed to list {:?}", folder))?
    {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("failed to stat {:?}", path))?;
        let is_hidden = entry.file_name().to_string_lossy().starts_with('.');
        let wanted = path.extension().is_some_and(|ext| {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            mode.extensions().contains(&ext.as_str())
        });
        if file_type.is_file() && wanted && !is_hidden {
            paths.push(path);
        }
    }
    paths.sort();

    let mut seen = BTreeSet::new();
    let mut units = Vec::with_capacity(paths.len());
    for (ordinal, path) in paths.into_iter().enumerate() {
        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("no file name in {:?}", path))?;
        if !seen.insert(id.clone()) {
            bail!("two input files share the name {id:?}; rename one of them");
        }
        units.push(SourceUnit { id, ordinal, path });
    }
    debug!(count = units.len(), "Discovered source units");
    Ok(units)
}
