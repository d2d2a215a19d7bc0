//! Stage sequencing.
//!
//! A run is a fixed sequence of [`Stage`]s:
//!
//! ```text
//! Harvest ──▶ Store ──▶ Load ──▶ Classify ──▶ (Transform)
//!    │          │         │          │
//!    └─ memory ─┘   partitions on disk    image_detections
//! ```
//!
//! Harvest hands its batches to Store in memory; Store makes them durable.
//! Every later stage reads partitions from the [`RawStore`] rather than the
//! previous stage's in-memory result, so any stage can be rerun on its own
//! (`harvest load --date ..`).
//!
//! Each stage reports per-unit outcomes (channel, partition, image). Unit
//! failures never stop a run. A stage error stops the run only when it is
//! [`PipelineError::FatalConfiguration`]; nothing that an earlier stage
//! persisted is rolled back.
//!
//! On cancellation the remaining stages are skipped, except Store when a
//! harvest batch is waiting: messages fetched before the stop are kept.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::classify::{self, Classifier, ImageStatus};
use crate::config::{ChannelConfig, Config, ImageDiscovery, TransformConfig};
use crate::detect::Detector;
use crate::error::{ErrorKind, PipelineError};
use crate::governor::RateGovernor;
use crate::harvest::{ChannelHarvest, ChannelHarvester, HarvestStatus};
use crate::loader::{LoadOutcome, Loader, PartitionStatus};
use crate::raw_store::{Partition, RawStore};
use crate::source::MessageSource;
use crate::store::CanonicalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Harvest,
    Store,
    Load,
    Classify,
    Transform,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Harvest => "harvest",
            StageKind::Store => "store",
            StageKind::Load => "load",
            StageKind::Classify => "classify",
            StageKind::Transform => "transform",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Succeeded,
    Partial,
    Skipped,
    Failed,
}

/// Outcome of one unit of work (a channel, a partition, an image).
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit: String,
    pub status: UnitStatus,
    pub kind: Option<ErrorKind>,
    pub detail: Option<String>,
}

impl UnitReport {
    pub fn succeeded(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            status: UnitStatus::Succeeded,
            kind: None,
            detail: None,
        }
    }

    pub fn with(
        unit: impl Into<String>,
        status: UnitStatus,
        kind: Option<ErrorKind>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            unit: unit.into(),
            status,
            kind,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: StageKind,
    pub units: Vec<UnitReport>,
    /// Stage-specific totals, e.g. `rows_inserted`.
    pub counters: Vec<(&'static str, u64)>,
    pub elapsed_ms: u64,
}

impl StageReport {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            units: Vec::new(),
            counters: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }

    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counters.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }

    /// True when no unit failed outright.
    pub fn is_clean(&self) -> bool {
        self.count(UnitStatus::Failed) == 0 && self.count(UnitStatus::Partial) == 0
    }

    /// Print the report in the CLI summary format.
    pub fn print_summary(&self) {
        println!("{}", self.stage);
        println!(
            "  units: {} (succeeded {}, partial {}, skipped {}, failed {})",
            self.units.len(),
            self.count(UnitStatus::Succeeded),
            self.count(UnitStatus::Partial),
            self.count(UnitStatus::Skipped),
            self.count(UnitStatus::Failed),
        );
        for (name, value) in &self.counters {
            println!("  {}: {}", name, value);
        }
        for unit in self.units.iter().filter(|u| u.status != UnitStatus::Succeeded) {
            let label = match unit.status {
                UnitStatus::Partial => "partial",
                UnitStatus::Skipped => "skipped",
                _ => "failed",
            };
            println!(
                "  {} {}: {}",
                label,
                unit.unit,
                unit.detail.as_deref().unwrap_or("")
            );
        }
        println!("  elapsed: {:.1}s", self.elapsed_ms as f64 / 1000.0);
        println!("{}", if self.is_clean() { "ok" } else { "completed with errors" });
    }
}

/// Which partitions Load and Classify work on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScope {
    Day(NaiveDate),
    All,
}

/// Shared state of one run.
pub struct RunContext {
    pub config: Arc<Config>,
    pub raw: Arc<RawStore>,
    pub cancel: CancellationToken,
    /// Calendar day new partitions are written under (UTC).
    pub run_day: NaiveDate,
    pub scope: PartitionScope,
    harvested: Mutex<Option<Vec<ChannelHarvest>>>,
}

impl RunContext {
    pub fn new(config: Arc<Config>, cancel: CancellationToken) -> Self {
        let run_day = Utc::now().date_naive();
        Self {
            raw: Arc::new(RawStore::from_config(&config)),
            config,
            cancel,
            run_day,
            scope: PartitionScope::Day(run_day),
            harvested: Mutex::new(None),
        }
    }

    pub fn with_run_day(mut self, day: NaiveDate) -> Self {
        self.run_day = day;
        if let PartitionScope::Day(_) = self.scope {
            self.scope = PartitionScope::Day(day);
        }
        self
    }

    pub fn with_scope(mut self, scope: PartitionScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn partitions(&self) -> Result<Vec<Partition>, PipelineError> {
        let day = match self.scope {
            PartitionScope::Day(d) => Some(d),
            PartitionScope::All => None,
        };
        Ok(self.raw.list_partitions(day)?)
    }

    fn hand_off(&self, batches: Vec<ChannelHarvest>) {
        *self.harvested.lock().unwrap_or_else(|e| e.into_inner()) = Some(batches);
    }

    fn take_harvested(&self) -> Option<Vec<ChannelHarvest>> {
        self.harvested.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// True while harvested batches are waiting for the Store stage.
    pub fn has_pending_batches(&self) -> bool {
        self.harvested
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// One step of a run.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Whether the stage still runs once the run has been cancelled.
    fn runs_after_cancel(&self, _ctx: &RunContext) -> bool {
        false
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageReport, PipelineError>;
}

// ============ Harvest ============

pub struct HarvestStage {
    harvester: ChannelHarvester,
    channels: Vec<ChannelConfig>,
}

impl HarvestStage {
    pub fn new(harvester: ChannelHarvester, channels: Vec<ChannelConfig>) -> Self {
        Self { harvester, channels }
    }
}

#[async_trait]
impl Stage for HarvestStage {
    fn kind(&self) -> StageKind {
        StageKind::Harvest
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageReport, PipelineError> {
        let batches = self.harvester.harvest_all(&self.channels, &ctx.cancel).await;

        let mut report = StageReport::new(StageKind::Harvest);
        let mut fetched = 0u64;
        for batch in &batches {
            fetched += batch.messages.len() as u64;
            report.units.push(match &batch.status {
                HarvestStatus::Complete => UnitReport::succeeded(&batch.channel),
                HarvestStatus::Partial { error } => UnitReport::with(
                    &batch.channel,
                    UnitStatus::Partial,
                    Some(ErrorKind::PerChannelFailure),
                    format!("{} messages before error: {}", batch.messages.len(), error),
                ),
                HarvestStatus::Cancelled => UnitReport::with(
                    &batch.channel,
                    UnitStatus::Partial,
                    None,
                    format!("cancelled after {} messages", batch.messages.len()),
                ),
            });
        }

        let governor = self.harvester.governor().stats();
        report.counters = vec![
            ("messages_fetched", fetched),
            ("throttles", governor.throttles),
            ("throttle_wait_secs", governor.waited.as_secs()),
        ];

        ctx.hand_off(batches);
        Ok(report)
    }
}

// ============ Store ============

pub struct StoreStage {
    keep_partial: bool,
}

impl StoreStage {
    pub fn new(keep_partial: bool) -> Self {
        Self { keep_partial }
    }
}

#[async_trait]
impl Stage for StoreStage {
    fn kind(&self) -> StageKind {
        StageKind::Store
    }

    /// Messages fetched before a stop are still persisted.
    fn runs_after_cancel(&self, ctx: &RunContext) -> bool {
        ctx.has_pending_batches()
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageReport, PipelineError> {
        let mut report = StageReport::new(StageKind::Store);
        let batches = ctx.take_harvested().unwrap_or_default();
        let mut written = 0u64;

        for batch in batches {
            // Cancelled channels keep what they fetched; failed ones only on request.
            let persist = match &batch.status {
                HarvestStatus::Complete | HarvestStatus::Cancelled => true,
                HarvestStatus::Partial { .. } => self.keep_partial,
            };
            if !persist {
                report.units.push(UnitReport::with(
                    &batch.channel,
                    UnitStatus::Skipped,
                    Some(ErrorKind::PerChannelFailure),
                    "harvest failed, batch excluded",
                ));
                continue;
            }
            if matches!(batch.status, HarvestStatus::Cancelled) && batch.messages.is_empty() {
                report.units.push(UnitReport::with(
                    &batch.channel,
                    UnitStatus::Skipped,
                    None,
                    "cancelled before any message",
                ));
                continue;
            }

            match ctx
                .raw
                .write_partition(&batch.channel, ctx.run_day, &batch.messages)
                .await
            {
                Ok(partition) => {
                    written += batch.messages.len() as u64;
                    report.units.push(UnitReport::succeeded(partition.to_string()));
                }
                Err(e) => {
                    warn!(channel = %batch.channel, error = %format!("{:#}", e), "failed to write partition");
                    report.units.push(UnitReport::with(
                        &batch.channel,
                        UnitStatus::Failed,
                        Some(ErrorKind::PerChannelFailure),
                        format!("{:#}", e),
                    ));
                }
            }
        }

        report.counters = vec![("messages_written", written)];
        Ok(report)
    }
}

// ============ Load ============

pub struct LoadStage {
    loader: Loader,
}

impl LoadStage {
    pub fn new(loader: Loader) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl Stage for LoadStage {
    fn kind(&self) -> StageKind {
        StageKind::Load
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageReport, PipelineError> {
        let partitions = ctx.partitions()?;
        let loads = self
            .loader
            .load_partitions(&ctx.raw, &partitions, &ctx.cancel)
            .await;

        let mut report = StageReport::new(StageKind::Load);
        let mut totals = LoadOutcome::default();
        for load in loads {
            let unit = load.partition.to_string();
            report.units.push(match load.status {
                PartitionStatus::Loaded(outcome) => {
                    totals.merge(&outcome);
                    if outcome.rows_failed == 0 {
                        UnitReport::succeeded(unit)
                    } else {
                        UnitReport::with(
                            unit,
                            UnitStatus::Partial,
                            Some(ErrorKind::PerRecordFailure),
                            format!("{} of {} records failed", outcome.rows_failed, outcome.rows_seen),
                        )
                    }
                }
                PartitionStatus::Failed(e) => {
                    UnitReport::with(unit, UnitStatus::Failed, Some(ErrorKind::PerRecordFailure), e)
                }
                PartitionStatus::Cancelled => {
                    UnitReport::with(unit, UnitStatus::Skipped, None, "cancelled")
                }
            });
        }

        report.counters = vec![
            ("rows_seen", totals.rows_seen),
            ("rows_inserted", totals.rows_inserted),
            ("rows_updated", totals.rows_updated),
            ("rows_skipped", totals.rows_skipped),
            ("rows_failed", totals.rows_failed),
        ];
        Ok(report)
    }
}

// ============ Classify ============

pub struct ClassifyStage {
    classifier: Classifier,
    discover: ImageDiscovery,
    image_root: PathBuf,
    extensions: Vec<String>,
}

impl ClassifyStage {
    pub fn new(config: &Config, classifier: Classifier) -> Self {
        Self {
            classifier,
            discover: config.classifier.discover,
            image_root: config.storage.image_path.clone(),
            extensions: config.classifier.image_extensions.clone(),
        }
    }
}

#[async_trait]
impl Stage for ClassifyStage {
    fn kind(&self) -> StageKind {
        StageKind::Classify
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageReport, PipelineError> {
        let images = match self.discover {
            ImageDiscovery::Snapshots => {
                let partitions = ctx.partitions()?;
                classify::discover_from_snapshots(&ctx.raw, &partitions).await
            }
            ImageDiscovery::Directory => {
                classify::discover_from_directory(&self.image_root, &self.extensions)?
            }
        };

        let outcomes = self.classifier.classify_all(&images, &ctx.cancel).await;

        let mut report = StageReport::new(StageKind::Classify);
        let mut detections = 0u64;
        for outcome in outcomes {
            let unit = outcome.image.path_str();
            report.units.push(match outcome.status {
                ImageStatus::Classified {
                    detections: n,
                    category,
                } => {
                    detections += n as u64;
                    UnitReport::with(unit, UnitStatus::Succeeded, None, category.as_str())
                }
                ImageStatus::Failed(e) => {
                    UnitReport::with(unit, UnitStatus::Failed, Some(ErrorKind::PerImageFailure), e)
                }
                ImageStatus::Cancelled => {
                    UnitReport::with(unit, UnitStatus::Skipped, None, "cancelled")
                }
            });
        }

        report.counters = vec![
            ("images_seen", images.len() as u64),
            ("objects_detected", detections),
        ];
        Ok(report)
    }
}

// ============ Transform ============

/// Runs the configured external transform command.
pub struct TransformStage {
    command: Vec<String>,
    workdir: Option<PathBuf>,
}

impl TransformStage {
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            command: config.command.clone(),
            workdir: config.workdir.clone(),
        }
    }
}

#[async_trait]
impl Stage for TransformStage {
    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    async fn run(&self, ctx: &RunContext) -> Result<StageReport, PipelineError> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            PipelineError::FatalConfiguration("transform.command must not be empty".into())
        })?;
        let unit = self.command.join(" ");

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        info!(command = %unit, "running transform");
        let output = tokio::select! {
            out = cmd.output() => out,
            _ = ctx.cancel.cancelled() => return Err(PipelineError::Cancelled),
        };

        let mut report = StageReport::new(StageKind::Transform);
        match output {
            Ok(output) if output.status.success() => {
                report.units.push(UnitReport::succeeded(unit));
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
                let tail: Vec<&str> = tail.into_iter().rev().collect();
                let detail = format!("exit status {}: {}", output.status, tail.join("\n"));
                warn!(command = %unit, status = %output.status, "transform failed");
                report
                    .units
                    .push(UnitReport::with(unit, UnitStatus::Failed, None, detail));
            }
            Err(e) => {
                warn!(command = %unit, error = %e, "transform could not start");
                report.units.push(UnitReport::with(
                    unit,
                    UnitStatus::Failed,
                    None,
                    format!("failed to start: {}", e),
                ));
            }
        }
        Ok(report)
    }
}

// ============ Coordinator ============

/// Reports of every stage that ran.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn stage(&self, kind: StageKind) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == kind)
    }
}

#[derive(Default)]
pub struct PipelineCoordinator {
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Box<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Run the stages in order.
    ///
    /// Returns `Err` only for a fatal configuration error. After a
    /// cancellation only stages that opt in through
    /// [`Stage::runs_after_cancel`] still run; the rest are skipped.
    pub async fn run(&self, ctx: &RunContext) -> Result<RunReport, PipelineError> {
        let mut report = RunReport {
            stages: Vec::new(),
            cancelled: false,
        };

        for stage in &self.stages {
            if ctx.cancel.is_cancelled() {
                report.cancelled = true;
                if !stage.runs_after_cancel(ctx) {
                    warn!(stage = %stage.kind(), "run cancelled, skipping stage");
                    continue;
                }
                info!(stage = %stage.kind(), "run cancelled, persisting fetched work");
            }

            info!(stage = %stage.kind(), "starting stage");
            let started = Instant::now();
            match stage.run(ctx).await {
                Ok(mut stage_report) => {
                    stage_report.elapsed_ms = started.elapsed().as_millis() as u64;
                    info!(
                        stage = %stage.kind(),
                        units = stage_report.units.len(),
                        failed = stage_report.count(UnitStatus::Failed),
                        elapsed_ms = stage_report.elapsed_ms,
                        "stage finished"
                    );
                    report.stages.push(stage_report);
                }
                Err(PipelineError::Cancelled) => {
                    warn!(stage = %stage.kind(), "stage cancelled");
                    report.cancelled = true;
                }
                Err(e) if e.kind().is_some_and(ErrorKind::is_fatal) => {
                    error!(stage = %stage.kind(), error = %e, "stage aborted the run");
                    return Err(e);
                }
                Err(e) => {
                    error!(stage = %stage.kind(), error = %format!("{:#}", e), "stage failed");
                    let mut failed = StageReport::new(stage.kind());
                    failed.units.push(UnitReport::with(
                        stage.kind().as_str(),
                        UnitStatus::Failed,
                        e.kind(),
                        format!("{:#}", e),
                    ));
                    failed.elapsed_ms = started.elapsed().as_millis() as u64;
                    report.stages.push(failed);
                }
            }
        }

        if ctx.cancel.is_cancelled() {
            report.cancelled = true;
        }
        Ok(report)
    }
}

/// The collaborators stages are built from.
pub struct Components {
    pub source: Arc<dyn MessageSource>,
    pub detector: Arc<dyn Detector>,
    pub store: Arc<dyn CanonicalStore>,
    pub governor: Arc<RateGovernor>,
}

/// Build a coordinator running `kinds` in the given order.
pub fn build_coordinator(
    config: &Config,
    components: &Components,
    kinds: &[StageKind],
) -> PipelineCoordinator {
    let mut coordinator = PipelineCoordinator::new();
    for kind in kinds {
        let stage: Box<dyn Stage> = match kind {
            StageKind::Harvest => Box::new(HarvestStage::new(
                ChannelHarvester::new(
                    config,
                    components.source.clone(),
                    components.governor.clone(),
                ),
                config.channels.clone(),
            )),
            StageKind::Store => Box::new(StoreStage::new(config.harvest.keep_partial)),
            StageKind::Load => Box::new(LoadStage::new(Loader::new(
                components.store.clone(),
                &config.loader,
            ))),
            StageKind::Classify => Box::new(ClassifyStage::new(
                config,
                Classifier::new(
                    &config.classifier,
                    components.detector.clone(),
                    components.store.clone(),
                ),
            )),
            StageKind::Transform => match &config.transform {
                Some(transform) => Box::new(TransformStage::new(transform)),
                None => continue,
            },
        };
        coordinator = coordinator.with_stage(stage);
    }
    coordinator
}
