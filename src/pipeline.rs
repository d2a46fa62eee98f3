//! The checkpointed phase pipeline.
//!
//! Phases run strictly in order: segment, recognize, repair, export. The
//! pipeline is the only owner of [`CheckpointState`]; workers report back
//! through the pool and never touch it. Progress is saved every few units,
//! and a phase is committed only once every one of its units has been
//! attempted. A task that fails after cancellation was probably killed along
//! with us, so its unit stays pending rather than being recorded as failed.

use std::{sync::Arc, time::Instant};

use futures::{FutureExt as _, StreamExt as _};

use crate::{
    async_utils::BoxedFuture,
    checkpoint::{CheckpointState, CheckpointStore, Phase, RunFingerprint, SegmentSummary},
    config::LayoutConfig,
    export::{ExportStats, write_csv},
    ocr::{CardRecognizer, CardRef},
    pool::{CancelToken, WorkFn, WorkerPool},
    prelude::*,
    record::{CardFields, Field, RecordEntry},
    segment::{Segmenter, UnitSegments},
    source::{InputMode, SourceUnit},
    ui::{ProgressConfig, Ui},
};

/// Knobs for one pipeline run.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Tasks to run at once.
    pub jobs: usize,
    /// Save the checkpoint after this many segmented units.
    pub checkpoint_every_units: usize,
    /// Save the checkpoint after this many recognized or repaired cards.
    pub checkpoint_every_records: usize,
    /// Stop cleanly once this phase has been committed.
    pub stop_after: Option<Phase>,
    /// Fields whose absence sends a card to the repair phase.
    pub repair_fields: Vec<Field>,
    /// Resume from an existing checkpoint, if it's valid.
    pub resume: bool,
    /// Keep the card files after a successful export.
    pub keep_work_files: bool,
    /// Where the CSV goes.
    pub output_path: PathBuf,
    /// Where card files are written, one subdirectory per unit.
    pub work_dir: PathBuf,
}

impl PipelineOptions {
    /// Defaults for a run writing to `output_path` and `work_dir`.
    pub fn new(output_path: PathBuf, work_dir: PathBuf) -> Self {
        Self {
            jobs: 1,
            checkpoint_every_units: 5,
            checkpoint_every_records: 500,
            stop_after: None,
            repair_fields: vec![Field::Age, Field::Gender],
            resume: true,
            keep_work_files: false,
            output_path,
            work_dir,
        }
    }
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    /// The export was written and the checkpoint removed.
    Completed {
        stats: ExportStats,
        elapsed_secs: f64,
    },
    /// We stopped early. A later run resumes at `phase`.
    Interrupted { phase: Phase },
}

/// Checkpoint state plus the clock for this session.
struct Session {
    state: CheckpointState,
    started: Instant,
    /// Time spent in earlier sessions.
    earlier_secs: f64,
}

impl Session {
    fn new(state: CheckpointState) -> Self {
        let earlier_secs = state.elapsed_secs;
        Self {
            state,
            started: Instant::now(),
            earlier_secs,
        }
    }

    fn elapsed_secs(&self) -> f64 {
        self.earlier_secs + self.started.elapsed().as_secs_f64()
    }

    async fn save(&mut self, store: &CheckpointStore) -> Result<()> {
        self.state.elapsed_secs = self.elapsed_secs();
        store.save(&self.state).await
    }
}

/// Counts completed units and says when it's time to save.
struct SaveCadence {
    every: usize,
    since_save: usize,
}

impl SaveCadence {
    fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            since_save: 0,
        }
    }

    fn tick(&mut self) -> bool {
        self.since_save += 1;
        if self.since_save >= self.every {
            self.since_save = 0;
            true
        } else {
            false
        }
    }
}

/// A resumable extraction run over a fixed list of source units.
pub struct Pipeline {
    ui: Ui,
    units: Vec<SourceUnit>,
    mode: InputMode,
    layout: LayoutConfig,
    segmenter: Arc<dyn Segmenter>,
    recognizer: Arc<dyn CardRecognizer>,
    store: CheckpointStore,
    opts: PipelineOptions,
    cancel: CancelToken,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ui: Ui,
        units: Vec<SourceUnit>,
        mode: InputMode,
        layout: LayoutConfig,
        segmenter: Arc<dyn Segmenter>,
        recognizer: Arc<dyn CardRecognizer>,
        store: CheckpointStore,
        opts: PipelineOptions,
        cancel: CancelToken,
    ) -> Self {
        Self {
            ui,
            units,
            mode,
            layout,
            segmenter,
            recognizer,
            store,
            opts,
            cancel,
        }
    }

    /// Run every remaining phase, or until cancelled.
    #[instrument(level = "debug", skip_all, fields(units = self.units.len()))]
    pub async fn run(&self) -> Result<RunOutcome> {
        let mut session = self.open_session().await?;
        loop {
            let phase = session.state.phase;
            if self.cancel.is_cancelled() {
                return self.interrupt(&mut session).await;
            }

            let finished = match phase {
                Phase::Segment => self.segment_phase(&mut session).await?,
                Phase::Recognize => self.recognize_phase(&mut session).await?,
                Phase::Repair => self.repair_phase(&mut session).await?,
                Phase::Export => return self.export_phase(&mut session).await,
                Phase::Done => bail!("checkpoint is already finished"),
            };
            if !finished {
                return self.interrupt(&mut session).await;
            }

            session.state.phase = phase.next();
            session.save(&self.store).await?;
            info!(completed = %phase, next = %session.state.phase, "Committed phase");
            if self.opts.stop_after == Some(phase) {
                self.ui.display_message(
                    "⏸️",
                    &format!("Stopped after {phase}; rerun to continue"),
                );
                return Ok(RunOutcome::Interrupted {
                    phase: session.state.phase,
                });
            }
        }
    }

    /// Load a checkpoint we can trust, or start from scratch.
    async fn open_session(&self) -> Result<Session> {
        let fingerprint = RunFingerprint::new(self.mode, &self.units, &self.layout);
        if !self.opts.resume {
            self.store.delete().await?;
        }

        let state = match self.store.load().await? {
            Some(state) => match state.validate(&fingerprint, &self.units) {
                Ok(()) => {
                    info!(phase = %state.phase, "Resuming from checkpoint");
                    self.ui.display_message(
                        "♻️",
                        &format!(
                            "Resuming at {} phase with {} records",
                            state.phase,
                            state.records.len()
                        ),
                    );
                    state
                }
                Err(err) => {
                    warn!("Discarding checkpoint {:?}: {:#}", self.store.path(), err);
                    self.store.delete().await?;
                    CheckpointState::new(fingerprint)
                }
            },
            None => CheckpointState::new(fingerprint),
        };

        // Card files from an abandoned run can't be trusted.
        if state.segments.is_empty() {
            remove_dir_if_exists(&self.opts.work_dir).await?;
        }
        Ok(Session::new(state))
    }

    async fn interrupt(&self, session: &mut Session) -> Result<RunOutcome> {
        session.save(&self.store).await?;
        let phase = session.state.phase;
        warn!(phase = %phase, "Interrupted; progress saved");
        self.ui.display_message(
            "🛑",
            &format!("Interrupted during {phase}; rerun to resume"),
        );
        Ok(RunOutcome::Interrupted { phase })
    }

    fn unit_dir(&self, unit: &SourceUnit) -> PathBuf {
        self.opts.work_dir.join(&unit.id)
    }

    fn pool(&self) -> WorkerPool {
        WorkerPool::new(self.opts.jobs, self.cancel.clone())
    }

    /// Cut every unsegmented unit into cards. Returns true if every unit has
    /// been attempted.
    #[instrument(level = "debug", skip_all)]
    async fn segment_phase(&self, session: &mut Session) -> Result<bool> {
        let pending = self
            .units
            .iter()
            .enumerate()
            .filter(|(_, unit)| !session.state.segments.contains_key(&unit.id))
            .map(|(pos, unit)| (pos, unit.clone()))
            .collect::<Vec<_>>();
        let pending_count = pending.len();

        let pb = self.ui.new_progress_bar(
            &ProgressConfig {
                emoji: "✂️",
                msg: "Segmenting units",
                done_msg: "Segmented units",
            },
            self.units.len() as u64,
        );
        pb.set_position((self.units.len() - pending_count) as u64);

        let segmenter = self.segmenter.clone();
        let work_dir = self.opts.work_dir.clone();
        let work_fn: WorkFn<SourceUnit, UnitSegments> =
            Arc::new(move |unit: SourceUnit| -> BoxedFuture<Result<UnitSegments>> {
                let segmenter = segmenter.clone();
                let dest = work_dir.join(&unit.id);
                async move { segmenter.segment_unit(&unit, &dest).await }.boxed()
            });

        let (mut results, worker) = self.pool().run(pending, work_fn);
        let mut cadence = SaveCadence::new(self.opts.checkpoint_every_units);
        let mut attempted = 0;
        while let Some((pos, result)) = results.next().await {
            let unit = &self.units[pos];
            let location = self.unit_dir(unit);
            let summary = match result {
                Some(segments) => SegmentSummary {
                    count: segments.count,
                    location,
                    pages: segments.pages,
                },
                // Tools may have died with us; retry the unit next run.
                None if self.cancel.is_cancelled() => {
                    debug!(unit = %unit.id, "Unit failed after cancellation; leaving it pending");
                    remove_dir_if_exists(&location).await?;
                    continue;
                }
                None => {
                    warn!(unit = %unit.id, "Unit failed to segment; it contributes no cards");
                    remove_dir_if_exists(&location).await?;
                    SegmentSummary {
                        count: 0,
                        location,
                        pages: 0,
                    }
                }
            };
            session.state.segments.insert(unit.id.clone(), summary);
            attempted += 1;
            pb.inc(1);
            if cadence.tick() {
                session.save(&self.store).await?;
            }
        }
        drop(results);
        worker.join().await?;

        let cards = session
            .state
            .segments
            .values()
            .map(|s| s.count)
            .sum::<usize>();
        info!(units = self.units.len(), cards, "Segmentation progress");
        Ok(attempted == pending_count)
    }

    /// Recognize every card without a record. Returns true if every card
    /// has been attempted.
    #[instrument(level = "debug", skip_all)]
    async fn recognize_phase(&self, session: &mut Session) -> Result<bool> {
        let cards = session.state.card_index(&self.units, self.mode);
        let pending = cards
            .iter()
            .filter(|card| !session.state.records.contains_key(&card.index))
            .map(|card| (card.index, card.clone()))
            .collect::<Vec<_>>();
        let pending_count = pending.len();

        let pb = self.ui.new_progress_bar(
            &ProgressConfig {
                emoji: "🔎",
                msg: "Recognizing cards",
                done_msg: "Recognized cards",
            },
            cards.len() as u64,
        );
        pb.set_position((cards.len() - pending_count) as u64);

        let recognizer = self.recognizer.clone();
        let work_fn: WorkFn<CardRef, CardFields> =
            Arc::new(move |card: CardRef| -> BoxedFuture<Result<CardFields>> {
                let recognizer = recognizer.clone();
                async move { recognizer.recognize(&card).await }.boxed()
            });

        let (mut results, worker) = self.pool().run(pending, work_fn);
        let mut cadence = SaveCadence::new(self.opts.checkpoint_every_records);
        let mut attempted = 0;
        while let Some((index, fields)) = results.next().await {
            if fields.is_none() && self.cancel.is_cancelled() {
                debug!(index, "Card failed after cancellation; leaving it pending");
                continue;
            }
            let card = &cards[index];
            session.state.records.insert(
                index,
                RecordEntry {
                    serial: card.serial,
                    fields,
                    source: card.unit_id.clone(),
                },
            );
            attempted += 1;
            pb.inc(1);
            if cadence.tick() {
                session.save(&self.store).await?;
            }
        }
        drop(results);
        worker.join().await?;

        let stats = ExportStats::from_records(session.state.records.values());
        debug!(
            records = stats.total,
            failed = stats.failed,
            "Recognition progress"
        );
        Ok(attempted == pending_count)
    }

    /// Retry cards that lack one of the repair fields. Cards we couldn't
    /// recognize at all, and cards that are already complete, are skipped.
    #[instrument(level = "debug", skip_all)]
    async fn repair_phase(&self, session: &mut Session) -> Result<bool> {
        let targets = self.opts.repair_fields.clone();
        let cards = session.state.card_index(&self.units, self.mode);
        let pending = cards
            .iter()
            .filter(|card| !session.state.repaired.contains(&card.index))
            .filter_map(|card| {
                let fields = session.state.records.get(&card.index)?.fields.as_ref()?;
                (!fields.missing(&targets).is_empty())
                    .then(|| (card.index, (card.clone(), fields.clone())))
            })
            .collect::<Vec<_>>();
        let pending_count = pending.len();
        info!(cards = pending_count, targets = ?targets, "Repairing incomplete cards");

        let pb = self.ui.new_progress_bar(
            &ProgressConfig {
                emoji: "🩹",
                msg: "Repairing cards",
                done_msg: "Repaired cards",
            },
            pending_count as u64,
        );

        let recognizer = self.recognizer.clone();
        let work_fn: WorkFn<(CardRef, CardFields), CardFields> = Arc::new(
            move |(card, fields): (CardRef, CardFields)| -> BoxedFuture<Result<CardFields>> {
                let recognizer = recognizer.clone();
                let targets = targets.clone();
                async move { recognizer.repair(&card, fields, &targets).await }.boxed()
            },
        );

        let (mut results, worker) = self.pool().run(pending, work_fn);
        let mut cadence = SaveCadence::new(self.opts.checkpoint_every_records);
        let mut attempted = 0;
        while let Some((index, repaired)) = results.next().await {
            if repaired.is_none() && self.cancel.is_cancelled() {
                debug!(index, "Repair failed after cancellation; leaving it pending");
                continue;
            }
            // A failed repair keeps what recognition found.
            if let Some(fields) = repaired
                && let Some(entry) = session.state.records.get_mut(&index)
            {
                entry.fields = Some(fields);
            }
            session.state.repaired.insert(index);
            attempted += 1;
            pb.inc(1);
            if cadence.tick() {
                session.save(&self.store).await?;
            }
        }
        drop(results);
        worker.join().await?;
        Ok(attempted == pending_count)
    }

    /// Write the CSV, then clean up the checkpoint and card files.
    #[instrument(level = "debug", skip_all, fields(path = %self.opts.output_path.display()))]
    async fn export_phase(&self, session: &mut Session) -> Result<RunOutcome> {
        let records = session.state.records.values();
        let rows = write_csv(&self.opts.output_path, records.clone()).await?;
        let stats = ExportStats::from_records(records);
        let elapsed_secs = session.elapsed_secs();
        session.state.phase = Phase::Done;

        self.store.delete().await?;
        if !self.opts.keep_work_files {
            remove_dir_if_exists(&self.opts.work_dir).await?;
        }

        info!(
            rows,
            failed = stats.failed,
            missing_age = stats.missing(Field::Age),
            missing_gender = stats.missing(Field::Gender),
            completeness = %format_args!("{:.1}%", stats.completeness_percent()),
            elapsed_secs = %format_args!("{elapsed_secs:.0}"),
            "Export complete"
        );
        self.ui.display_message(
            "✅",
            &format!(
                "Wrote {} records to {} in {:.1} min",
                rows,
                self.opts.output_path.display(),
                elapsed_secs / 60.0
            ),
        );
        let missing = Field::ALL
            .iter()
            .map(|&field| format!("{field} {}", stats.missing(field)))
            .collect::<Vec<_>>()
            .join(", ");
        self.ui.display_message(
            "📊",
            &format!(
                "Completeness {:.1}% (failed {}; missing: {})",
                stats.completeness_percent(),
                stats.failed,
                missing
            ),
        );
        Ok(RunOutcome::Completed {
            stats,
            elapsed_secs,
        })
    }
}

/// Remove `dir` and everything in it, if it exists.
async fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {:?}", dir)),
    }
}
