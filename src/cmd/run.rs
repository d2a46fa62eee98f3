//! The `run` subcommand.

use std::{process::ExitCode, sync::Arc};

use clap::Args;

use crate::{
    checkpoint::{CheckpointStore, Phase},
    config::{LayoutConfig, check_thread_budget, default_job_count},
    ocr::{CardRecognizer, FragmentCardRecognizer, ImageCardRecognizer, TesseractRecognizer},
    pipeline::{Pipeline, PipelineOptions, RunOutcome},
    pool::CancelToken,
    prelude::*,
    record::Field,
    render::PopplerRenderer,
    segment::{FragmentSegmenter, ImageSegmenter, Segmenter},
    source::{InputMode, discover_units},
    ui::Ui,
};

/// Exit status when the input folder holds no source units.
pub const EXIT_NO_INPUT: u8 = 3;

/// Exit status when a run stopped before exporting.
pub const EXIT_INTERRUPTED: u8 = 4;

/// Run command line arguments.
#[derive(Debug, Args)]
pub struct RunOpts {
    /// Folder holding the source documents.
    pub folder: PathBuf,

    /// How to read cards from the source documents.
    #[clap(long, value_enum, default_value = "images")]
    pub mode: InputMode,

    /// Tasks to run at once. Defaults to as many as fit on this machine.
    #[clap(short = 'j', long = "jobs")]
    pub jobs: Option<usize>,

    /// Threads each OCR process may use.
    #[clap(long, default_value = "1")]
    pub ocr_threads: usize,

    /// OCR languages, in `tesseract -l` syntax.
    #[clap(long, default_value = "tam+eng")]
    pub ocr_lang: String,

    /// Ignore any existing checkpoint and start over.
    #[clap(long)]
    pub no_resume: bool,

    /// Page layout file (TOML or JSON). Defaults to the standard roll
    /// template.
    #[clap(long)]
    pub layout: Option<PathBuf>,

    /// Output CSV path. Defaults to `<parent>/output/<folder>.csv`.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Directory for card files. Defaults to `<parent>/.<folder>_temp_cards`.
    #[clap(long)]
    pub work_dir: Option<PathBuf>,

    /// Checkpoint path. Defaults to `<parent>/.<folder>_checkpoint.json`.
    #[clap(long)]
    pub checkpoint: Option<PathBuf>,

    /// Save the checkpoint after this many cards.
    #[clap(long, default_value = "500")]
    pub checkpoint_every: usize,

    /// Stop cleanly after this phase.
    #[clap(long, value_enum)]
    pub stop_after: Option<Phase>,

    /// Keep card files after a successful export.
    #[clap(long)]
    pub keep_work_files: bool,

    /// Fields whose absence triggers a repair pass.
    #[clap(long, value_enum, value_delimiter = ',', default_value = "age,gender")]
    pub repair_fields: Vec<Field>,
}

/// Where a run keeps its files when not told otherwise.
#[derive(Debug, PartialEq, Eq)]
struct DefaultPaths {
    checkpoint: PathBuf,
    work_dir: PathBuf,
    output: PathBuf,
}

impl DefaultPaths {
    /// Everything lives beside `folder`, named after it.
    fn for_folder(folder: &Path) -> Result<Self> {
        let name = folder
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("cannot name outputs after {:?}", folder))?;
        let parent = folder.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self {
            checkpoint: parent.join(format!(".{name}_checkpoint.json")),
            work_dir: parent.join(format!(".{name}_temp_cards")),
            output: parent.join("output").join(format!("{name}.csv")),
        })
    }
}

/// The `run` subcommand.
#[instrument(level = "debug", skip_all, fields(folder = %opts.folder.display()))]
pub async fn cmd_run(ui: Ui, opts: &RunOpts) -> Result<ExitCode> {
    let folder = tokio::fs::canonicalize(&opts.folder)
        .await
        .with_context(|| format!("cannot find input folder {:?}", opts.folder))?;
    if !folder.is_dir() {
        bail!("{:?} is not a folder", opts.folder);
    }
    let defaults = DefaultPaths::for_folder(&folder)?;
    let layout = LayoutConfig::load(opts.layout.as_deref()).await?;

    let cores = num_cpus::get();
    let jobs = match opts.mode {
        InputMode::Images => {
            let jobs = opts
                .jobs
                .unwrap_or_else(|| default_job_count(opts.ocr_threads, cores));
            check_thread_budget(jobs, opts.ocr_threads, cores)?;
            jobs
        }
        InputMode::Fragments => opts.jobs.unwrap_or(cores).max(1),
    };

    let units = discover_units(&folder, opts.mode).await?;
    if units.is_empty() {
        warn!("No source documents found in {:?}", folder);
        ui.display_message("📭", &format!("Nothing to do in {}", folder.display()));
        return Ok(ExitCode::from(EXIT_NO_INPUT));
    }
    info!(units = units.len(), jobs, mode = ?opts.mode, "Starting run");

    let (segmenter, recognizer): (Arc<dyn Segmenter>, Arc<dyn CardRecognizer>) =
        match opts.mode {
            InputMode::Images => (
                Arc::new(ImageSegmenter::new(
                    Arc::new(PopplerRenderer::new(layout.render_dpi)),
                    layout.clone(),
                )),
                Arc::new(ImageCardRecognizer::new(
                    Arc::new(TesseractRecognizer::new(&opts.ocr_lang, opts.ocr_threads)),
                    layout.clone(),
                )),
            ),
            InputMode::Fragments => (
                Arc::new(FragmentSegmenter::new(layout.clone())),
                Arc::new(FragmentCardRecognizer),
            ),
        };

    let mut pipeline_opts = PipelineOptions::new(
        opts.output_path.clone().unwrap_or(defaults.output),
        opts.work_dir.clone().unwrap_or(defaults.work_dir),
    );
    pipeline_opts.jobs = jobs;
    pipeline_opts.checkpoint_every_records = opts.checkpoint_every;
    pipeline_opts.stop_after = opts.stop_after;
    pipeline_opts.repair_fields = opts.repair_fields.clone();
    pipeline_opts.resume = !opts.no_resume;
    pipeline_opts.keep_work_files = opts.keep_work_files;

    let cancel = CancelToken::default();
    spawn_ctrl_c_handler(cancel.clone());

    let pipeline = Pipeline::new(
        ui,
        units,
        opts.mode,
        layout,
        segmenter,
        recognizer,
        CheckpointStore::new(opts.checkpoint.clone().unwrap_or(defaults.checkpoint)),
        pipeline_opts,
        cancel,
    );
    match pipeline.run().await? {
        RunOutcome::Completed { .. } => Ok(ExitCode::SUCCESS),
        RunOutcome::Interrupted { .. } => Ok(ExitCode::from(EXIT_INTERRUPTED)),
    }
}

/// What a Ctrl-C should do.
#[derive(Debug, PartialEq, Eq)]
enum InterruptAction {
    /// Let in-flight work finish, then save.
    Cancel,
    /// Stop now. Progress since the last save is lost.
    ForceExit,
}

/// Cancel on the first Ctrl-C; any later one forces an exit.
fn on_interrupt(cancel: &CancelToken) -> InterruptAction {
    if cancel.is_cancelled() {
        InterruptAction::ForceExit
    } else {
        cancel.cancel();
        InterruptAction::Cancel
    }
}

/// Turn the first Ctrl-C into a cooperative cancel. In-flight work finishes
/// and the checkpoint is saved. A second Ctrl-C exits at once.
fn spawn_ctrl_c_handler(cancel: CancelToken) {
    tokio::spawn(async move {
        loop {
            if let Err(err) = tokio::signal::ctrl_c().await {
                debug!("Cannot listen for Ctrl-C: {}", err);
                return;
            }
            match on_interrupt(&cancel) {
                InterruptAction::Cancel => warn!(
                    "Ctrl-C received; finishing in-flight work and saving progress \
                     (press Ctrl-C again to quit now)"
                ),
                InterruptAction::ForceExit => {
                    error!("Second Ctrl-C received; exiting without saving");
                    std::process::exit(i32::from(EXIT_INTERRUPTED));
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_interrupt_forces_exit() {
        let cancel = CancelToken::default();
        assert_eq!(on_interrupt(&cancel), InterruptAction::Cancel);
        assert!(cancel.is_cancelled());
        assert_eq!(on_interrupt(&cancel), InterruptAction::ForceExit);
        assert_eq!(on_interrupt(&cancel), InterruptAction::ForceExit);
    }

    #[test]
    fn default_paths_sit_beside_the_folder() -> Result<()> {
        let paths = DefaultPaths::for_folder(Path::new("/data/rolls/ac114"))?;
        assert_eq!(
            paths,
            DefaultPaths {
                checkpoint: PathBuf::from("/data/rolls/.ac114_checkpoint.json"),
                work_dir: PathBuf::from("/data/rolls/.ac114_temp_cards"),
                output: PathBuf::from("/data/rolls/output/ac114.csv"),
            }
        );
        assert!(DefaultPaths::for_folder(Path::new("/")).is_err());
        Ok(())
    }
}
