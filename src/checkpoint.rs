//! Persistent run state, so a restarted run picks up where it stopped.
//!
//! There is exactly one writer, the pipeline. Saves go to a temporary file in
//! the same directory which is then renamed over the old checkpoint, so a
//! crash mid-save leaves the previous snapshot intact.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    io::Write as _,
};

use clap::ValueEnum;

use crate::{
    async_utils::run_blocking,
    config::LayoutConfig,
    ocr::CardRef,
    prelude::*,
    record::RecordEntry,
    source::{InputMode, SourceUnit},
};

/// Pipeline phases, in the only order they may run. A checkpoint at phase
/// `n` has completed every phase before `n`.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord,
    ValueEnum,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum Phase {
    /// Cut source units into cards.
    #[default]
    Segment,
    /// Extract fields from every card.
    Recognize,
    /// Retry cards with missing fields.
    Repair,
    /// Write the export file.
    Export,
    /// Nothing left to do.
    #[value(skip)]
    Done,
}

impl Phase {
    /// The phase after this one.
    pub fn next(self) -> Phase {
        match self {
            Phase::Segment => Phase::Recognize,
            Phase::Recognize => Phase::Repair,
            Phase::Repair => Phase::Export,
            Phase::Export | Phase::Done => Phase::Done,
        }
    }
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> u8 {
        match phase {
            Phase::Segment => 0,
            Phase::Recognize => 1,
            Phase::Repair => 2,
            Phase::Export => 3,
            Phase::Done => 4,
        }
    }
}

impl TryFrom<u8> for Phase {
    type Error = String;

    fn try_from(value: u8) -> Result<Phase, String> {
        match value {
            0 => Ok(Phase::Segment),
            1 => Ok(Phase::Recognize),
            2 => Ok(Phase::Repair),
            3 => Ok(Phase::Export),
            4 => Ok(Phase::Done),
            other => Err(format!("unknown phase {other}")),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Segment => "segment",
            Phase::Recognize => "recognize",
            Phase::Repair => "repair",
            Phase::Export => "export",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Everything that determines card numbering. A checkpoint written for a
/// different fingerprint can't be resumed.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RunFingerprint {
    pub mode: InputMode,
    /// Source unit identifiers, in ordinal order.
    pub units: Vec<String>,
    pub layout: LayoutConfig,
}

impl RunFingerprint {
    pub fn new(mode: InputMode, units: &[SourceUnit], layout: &LayoutConfig) -> Self {
        Self {
            mode,
            units: units.iter().map(|u| u.id.clone()).collect(),
            layout: layout.clone(),
        }
    }
}

/// Segmentation result for one source unit.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SegmentSummary {
    /// Number of cards cut from the unit. Zero if the unit failed.
    pub count: usize,
    /// Directory holding the unit's card files.
    pub location: PathBuf,
    /// Page count of the unit, if we got far enough to learn it.
    pub pages: usize,
}

/// Persisted pipeline state.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CheckpointState {
    pub fingerprint: RunFingerprint,
    /// The next phase to run.
    #[schemars(with = "u8")]
    pub phase: Phase,
    /// Segmentation results, keyed by unit identifier.
    pub segments: BTreeMap<String, SegmentSummary>,
    /// The record table, keyed by global card index.
    pub records: BTreeMap<usize, RecordEntry>,
    /// Indices whose repair attempt has finished.
    pub repaired: BTreeSet<usize>,
    /// Wall-clock seconds spent in earlier sessions of this run.
    pub elapsed_secs: f64,
}

impl CheckpointState {
    /// A fresh state for a new run.
    pub fn new(fingerprint: RunFingerprint) -> Self {
        Self {
            fingerprint,
            phase: Phase::Segment,
            segments: BTreeMap::new(),
            records: BTreeMap::new(),
            repaired: BTreeSet::new(),
            elapsed_secs: 0.0,
        }
    }

    /// Every card, in global index order. Indices follow unit order and then
    /// serial order, so the same segmentation always yields the same index.
    /// Units not yet segmented contribute no cards.
    pub fn card_index(&self, units: &[SourceUnit], mode: InputMode) -> Vec<CardRef> {
        let mut cards = vec![];
        for unit in units {
            let Some(summary) = self.segments.get(&unit.id) else {
                continue;
            };
            for serial in 1..=summary.count {
                cards.push(CardRef {
                    index: cards.len(),
                    unit_id: unit.id.clone(),
                    serial,
                    path: summary
                        .location
                        .join(format!("{serial}.{}", mode.card_extension())),
                });
            }
        }
        cards
    }

    /// Check that this state could have been produced by this run. Anything
    /// else must be thrown away, never merged.
    pub fn validate(&self, expected: &RunFingerprint, units: &[SourceUnit]) -> Result<()> {
        if &self.fingerprint != expected {
            bail!("checkpoint was written for different inputs or layout");
        }
        if self.phase == Phase::Done {
            bail!("checkpoint is for a finished run");
        }
        if let Some(unknown) = self
            .segments
            .keys()
            .find(|id| !expected.units.contains(*id))
        {
            bail!("checkpoint mentions unknown unit {unknown:?}");
        }
        if self.phase > Phase::Segment && self.segments.len() != units.len() {
            bail!("checkpoint finished segmentation without every unit");
        }

        let cards = self.card_index(units, self.fingerprint.mode);
        for (&index, entry) in &self.records {
            let Some(card) = cards.get(index) else {
                bail!("record {index} has no matching card");
            };
            if card.serial != entry.serial || card.unit_id != entry.source {
                bail!("record {index} does not match card numbering");
            }
        }
        if self.phase > Phase::Recognize && self.records.len() != cards.len() {
            bail!("checkpoint finished recognition without every card");
        }
        if let Some(index) = self.repaired.iter().find(|i| !self.records.contains_key(*i)) {
            bail!("repaired index {index} has no record");
        }

        // Every phase before export reads back the cards already written.
        if self.phase < Phase::Export
            && let Some(summary) = self
                .segments
                .values()
                .find(|s| s.count > 0 && !s.location.is_dir())
        {
            bail!("card directory {:?} has disappeared", summary.location);
        }
        Ok(())
    }
}

/// Reads and writes the checkpoint file.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint, if there is a readable one. An unreadable
    /// checkpoint is deleted and treated as missing.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    pub async fn load(&self) -> Result<Option<CheckpointState>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read checkpoint {:?}", self.path));
            }
        };
        match serde_json::from_slice::<CheckpointState>(&data) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                warn!("Discarding unreadable checkpoint {:?}: {}", self.path, err);
                self.delete().await?;
                Ok(None)
            }
        }
    }

    /// Atomically replace the checkpoint with `state`.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    pub async fn save(&self, state: &CheckpointState) -> Result<()> {
        let data = serde_json::to_vec(state).context("failed to serialize checkpoint")?;
        let path = self.path.clone();
        run_blocking(move || {
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir.to_owned(),
                _ => PathBuf::from("."),
            };
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {:?}", dir))?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)
                .with_context(|| format!("failed to create temporary file in {:?}", dir))?;
            tmp.write_all(&data)
                .context("failed to write checkpoint")?;
            tmp.as_file()
                .sync_all()
                .context("failed to sync checkpoint")?;
            tmp.persist(&path)
                .with_context(|| format!("failed to replace checkpoint {:?}", path))?;
            Ok(())
        })
        .await?;
        trace!("Saved checkpoint");
        Ok(())
    }

    /// Remove the checkpoint, if it exists.
    pub async fn delete(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to delete checkpoint {:?}", self.path))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CardFields, Gender, RelationType};

    fn units() -> Vec<SourceUnit> {
        ["a", "b"]
            .iter()
            .enumerate()
            .map(|(ordinal, id)| SourceUnit {
                id: (*id).to_owned(),
                ordinal,
                path: PathBuf::from(format!("{id}.json")),
            })
            .collect()
    }

    fn sample_state(dir: &Path) -> CheckpointState {
        let units = units();
        let mut state = CheckpointState::new(RunFingerprint::new(
            InputMode::Fragments,
            &units,
            &LayoutConfig::default(),
        ));
        state.phase = Phase::Repair;
        state.segments.insert(
            "a".to_owned(),
            SegmentSummary {
                count: 2,
                location: dir.join("a"),
                pages: 3,
            },
        );
        state.segments.insert(
            "b".to_owned(),
            SegmentSummary {
                count: 1,
                location: dir.join("b"),
                pages: 1,
            },
        );
        let fields = CardFields {
            voter_id: "ABC1234567".to_owned(),
            name: "முருகன்".to_owned(),
            relation_type: RelationType::Father,
            relation_name: "ராமசாமி".to_owned(),
            age: "45".to_owned(),
            gender: Gender::Male,
            ..CardFields::default()
        };
        for (index, (serial, source)) in [(1, "a"), (2, "a"), (1, "b")].into_iter().enumerate() {
            state.records.insert(
                index,
                RecordEntry {
                    serial,
                    fields: (index != 1).then(|| fields.clone()),
                    source: source.to_owned(),
                },
            );
        }
        state.repaired.insert(2);
        state.elapsed_secs = 1234.567_890_123;
        state
    }

    #[tokio::test]
    async fn checkpoint_round_trips_exactly() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("checkpoint")?;
        let store = CheckpointStore::new(dir.path().join("run.json"));
        let state = sample_state(dir.path());
        store.save(&state).await?;
        let loaded = store.load().await?.expect("checkpoint should exist");
        assert_eq!(loaded, state);

        // Phase is an integer and record keys are strings on disk.
        let json: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(store.path()).await?)?;
        assert_eq!(json["phase"], 2);
        assert!(json["records"]["1"]["fields"].is_null());
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_checkpoints_are_discarded() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("checkpoint")?;
        let store = CheckpointStore::new(dir.path().join("run.json"));
        tokio::fs::write(store.path(), b"{\"phase\": 2, \"recor").await?;
        assert!(store.load().await?.is_none());
        assert!(!store.path().exists());
        Ok(())
    }

    #[tokio::test]
    async fn missing_checkpoint_is_none() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("checkpoint")?;
        let store = CheckpointStore::new(dir.path().join("run.json"));
        assert!(store.load().await?.is_none());
        store.delete().await?;
        Ok(())
    }

    #[test]
    fn card_index_is_deterministic() {
        let dir = PathBuf::from("/work");
        let state = sample_state(&dir);
        let cards = state.card_index(&units(), InputMode::Fragments);
        let summary = cards
            .iter()
            .map(|c| (c.index, c.unit_id.as_str(), c.serial))
            .collect::<Vec<_>>();
        assert_eq!(summary, [(0, "a", 1), (1, "a", 2), (2, "b", 1)]);
        assert_eq!(cards[1].path, PathBuf::from("/work/a/2.json"));
    }

    #[test]
    fn validation_rejects_foreign_or_inconsistent_state() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("checkpoint")?;
        std::fs::create_dir(dir.path().join("a"))?;
        std::fs::create_dir(dir.path().join("b"))?;
        let units = units();
        let expected = RunFingerprint::new(InputMode::Fragments, &units, &LayoutConfig::default());
        let state = sample_state(dir.path());
        state.validate(&expected, &units)?;

        let other_layout = RunFingerprint {
            layout: LayoutConfig {
                rows: 8,
                ..LayoutConfig::default()
            },
            ..expected.clone()
        };
        assert!(state.validate(&other_layout, &units).is_err());

        let mut renumbered = state.clone();
        renumbered.segments.get_mut("a").unwrap().count = 1;
        assert!(renumbered.validate(&expected, &units).is_err());

        let mut orphan = state.clone();
        orphan.repaired.insert(9);
        assert!(orphan.validate(&expected, &units).is_err());

        let mut unsegmented = state.clone();
        unsegmented.segments.remove("b");
        assert!(unsegmented.validate(&expected, &units).is_err());

        let mut vanished = state;
        std::fs::remove_dir(dir.path().join("b"))?;
        vanished.phase = Phase::Recognize;
        assert!(vanished.validate(&expected, &units).is_err());
        Ok(())
    }

    #[test]
    fn partial_segmentation_needs_its_card_directories() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("checkpoint")?;
        let units = units();
        let expected = RunFingerprint::new(InputMode::Fragments, &units, &LayoutConfig::default());
        let mut state = sample_state(dir.path());
        state.phase = Phase::Segment;
        state.segments.remove("b");
        state.records.clear();
        state.repaired.clear();

        std::fs::create_dir(dir.path().join("a"))?;
        state.validate(&expected, &units)?;

        std::fs::remove_dir(dir.path().join("a"))?;
        let err = state
            .validate(&expected, &units)
            .expect_err("missing cards should be rejected");
        assert!(err.to_string().contains("has disappeared"));

        // Export only needs the record table.
        let mut finished = sample_state(dir.path());
        finished.phase = Phase::Export;
        finished.repaired.clear();
        finished.validate(&expected, &units)?;
        Ok(())
    }

    #[test]
    fn unknown_phase_numbers_are_rejected() {
        assert!(serde_json::from_str::<Phase>("7").is_err());
        assert_eq!(serde_json::from_str::<Phase>("3").unwrap(), Phase::Export);
    }
}
