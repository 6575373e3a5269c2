//! Scheduler: drives minute ticks and the daily priority refresh.
//!
//! At most one collection run is in flight: a tick takes an owned permit on
//! `run_gate` for its whole duration (scheduled run, cascade, sweeps and gap
//! drain). A tick that fires while the permit is held is skipped and its
//! bucket queued as `overlap`. The priority refresh runs on its own timer
//! and only touches the priority tables.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration as StdDuration,
};

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use shared_utils::clock::Clock;
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    aggregation::{AggregationCascade, CascadeReport, SweepReport},
    bucket::floor,
    collection::{CollectionRunner, RunError},
    db::Db,
    gaps::{DrainReport, GapError, GapReason, GapRecoveryQueue},
    granularity::Granularity,
    priority::{CollectionMode, PriorityError, PriorityState, PriorityStore, RefreshReport},
    runs::{self, RunKind, RunRecord, RunStatus, RunTally},
    tz,
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Gap(#[from] GapError),

    #[error("scheduler store: {0}")]
    Store(#[from] anyhow::Error),
}

/// Scheduling knobs.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub mode: CollectionMode,
    /// Local hour (0-23) of the daily priority refresh.
    pub refresh_hour: u32,
    /// Zone `refresh_hour` is read in.
    pub refresh_tz: Tz,
    /// How far back gap detection looks for uncovered buckets.
    pub gap_lookback: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    RunningScheduledCollection,
}

/// Everything one executed tick did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    /// Earlier minutes found uncovered when the tick started (late timer,
    /// clock jump, suspended host) and queued as `missed`.
    pub gaps_enqueued: usize,
    pub run: RunRecord,
    /// The bucket went to the gap queue because coverage was incomplete.
    pub enqueued: bool,
    pub cascade: Option<CascadeReport>,
    pub sweep: Option<SweepReport>,
    pub drain: Option<DrainReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TickOutcome {
    Ran(Box<TickReport>),
    /// A run was still in flight; the bucket was queued as `overlap`.
    Skipped { bucket: DateTime<Utc> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StartupReport {
    /// Runs left `running` by a previous process, now closed as failed.
    pub interrupted_runs: usize,
    pub priorities_loaded: usize,
    pub refreshed: bool,
    pub gaps_enqueued: usize,
}

/// Lowers the flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlagGuard(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    db: Arc<Db>,
    runner: Arc<CollectionRunner>,
    priorities: Arc<PriorityStore>,
    cascade: Arc<AggregationCascade>,
    queue: Arc<GapRecoveryQueue>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    run_gate: Arc<Mutex<()>>,
    collecting: AtomicBool,
    refreshing: AtomicBool,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Db>,
        runner: Arc<CollectionRunner>,
        priorities: Arc<PriorityStore>,
        cascade: Arc<AggregationCascade>,
        queue: Arc<GapRecoveryQueue>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            db,
            runner,
            priorities,
            cascade,
            queue,
            clock,
            settings,
            run_gate: Arc::new(Mutex::new(())),
            collecting: AtomicBool::new(false),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.collecting.load(Ordering::Acquire) {
            SchedulerState::RunningScheduledCollection
        } else {
            SchedulerState::Idle
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    pub fn queue(&self) -> &GapRecoveryQueue {
        &self.queue
    }

    /// Recovers from the previous process: closes its dangling runs,
    /// hydrates priorities (refreshing if none are stored) and queues the
    /// uncovered buckets since the last good one.
    #[instrument(skip(self))]
    pub async fn startup(&self) -> Result<StartupReport, SchedulerError> {
        let mut report = StartupReport::default();
        let now = self.clock.now();

        for run in self.db.with_conn(runs::dangling)? {
            self.db.with_conn(|c| {
                runs::finalize(
                    c,
                    run.run_id,
                    RunStatus::Failed,
                    RunTally::default(),
                    now,
                    Some("interrupted by restart"),
                )
            })?;
            warn!(run_id = run.run_id, kind = run.kind.as_str(), "closed interrupted run");
            report.interrupted_runs += 1;
        }

        match self.priorities.load() {
            Ok(n) => report.priorities_loaded = n,
            Err(e) => warn!(error = %e, "could not load stored ranking"),
        }
        if matches!(*self.priorities.state(), PriorityState::Empty) {
            report.refreshed = matches!(self.refresh_priorities().await, Some(Ok(_)));
        }

        report.gaps_enqueued = self.queue.detect_and_enqueue(self.settings.gap_lookback)?;
        info!(?report, "startup complete");
        Ok(report)
    }

    /// One minute tick: queue minutes skipped since the last covered one,
    /// then the scheduled run for the current bucket, cascade, retention
    /// sweeps and due gap recovery. A bucket left without full coverage is
    /// queued last.
    #[instrument(skip_all)]
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickOutcome, SchedulerError> {
        let bucket = floor(self.clock.now(), Granularity::Minute);
        let Ok(_permit) = self.run_gate.clone().try_lock_owned() else {
            info!(bucket = %bucket, "previous run still executing, skipping tick");
            self.queue.enqueue(bucket, GapReason::Overlap)?;
            return Ok(TickOutcome::Skipped { bucket });
        };

        let gaps_enqueued = match self.queue.detect_and_enqueue(self.settings.gap_lookback) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "gap detection failed");
                0
            }
        };

        let run = {
            let _busy = FlagGuard::raise(&self.collecting);
            self.runner
                .execute(RunKind::Scheduled, self.settings.mode, bucket, cancel)
                .await?
        };

        let mut report = TickReport {
            gaps_enqueued,
            enqueued: false,
            cascade: None,
            sweep: None,
            drain: None,
            run,
        };
        if report.run.status == RunStatus::Cancelled {
            return Ok(TickOutcome::Ran(Box::new(report)));
        }
        let now = self.clock.now();
        match self.cascade.cascade(now) {
            Ok(c) => report.cascade = Some(c),
            Err(e) => warn!(error = %e, "cascade failed"),
        }
        match self.cascade.sweep_all(now) {
            Ok(s) => report.sweep = Some(s),
            Err(e) => warn!(error = %e, "retention sweep failed"),
        }
        match self
            .queue
            .drain(&self.runner, &self.cascade, self.settings.mode, cancel)
            .await
        {
            Ok(d) => report.drain = Some(d),
            Err(e) => warn!(error = %e, "gap drain failed"),
        }
        // after the drain: the current bucket is not retried by the tick that collected it
        if !report.run.is_full_coverage() {
            report.enqueued = self.queue.enqueue(bucket, GapReason::PartialFailure)?;
        }
        Ok(TickOutcome::Ran(Box::new(report)))
    }

    /// Drains due gap entries outside a tick, still holding the run permit.
    ///
    /// Returns `None` when a run is in flight.
    pub async fn drain_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<DrainReport>, SchedulerError> {
        let Ok(_permit) = self.run_gate.clone().try_lock_owned() else {
            return Ok(None);
        };
        let report = self
            .queue
            .drain(&self.runner, &self.cascade, self.settings.mode, cancel)
            .await?;
        Ok(Some(report))
    }

    /// Refreshes priorities unless a refresh is already running (`None`).
    pub async fn refresh_priorities(&self) -> Option<Result<RefreshReport, PriorityError>> {
        let _busy = FlagGuard::raise(&self.refreshing)?;
        Some(self.priorities.refresh().await)
    }

    /// Runs until `cancel` fires: startup, then one tick per minute plus the
    /// daily refresh timer. In-flight work is cancelled and awaited on exit.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), SchedulerError> {
        self.startup().await?;
        let refresher = tokio::spawn(self.clone().refresh_loop(cancel.child_token()));
        let mut ticks = JoinSet::new();

        loop {
            while let Some(done) = ticks.try_join_next() {
                if let Err(e) = done {
                    error!(error = %e, "tick task panicked");
                }
            }
            let this = self.clone();
            let token = cancel.child_token();
            ticks.spawn(async move {
                match this.tick(&token).await {
                    Ok(TickOutcome::Skipped { bucket }) => debug!(bucket = %bucket, "tick skipped"),
                    Ok(TickOutcome::Ran(r)) => debug!(run_id = r.run.run_id, status = %r.run.status, "tick done"),
                    Err(e) => error!(error = %e, "tick failed"),
                }
            });

            let wait = until_next_minute(self.clock.now());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(in_flight = ticks.len(), "shutting down scheduler");
        while let Some(done) = ticks.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "tick task panicked");
            }
        }
        if let Err(e) = refresher.await {
            error!(error = %e, "refresh task panicked");
        }
        info!("scheduler stopped");
        Ok(())
    }

    async fn refresh_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let now = self.clock.now();
            let next = match tz::next_daily_at(now, self.settings.refresh_hour, self.settings.refresh_tz) {
                Ok(t) => t,
                Err(e) => {
                    error!(error = %e, "cannot schedule priority refresh");
                    return;
                }
            };
            info!(next_refresh = %next, "priority refresh scheduled");
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                res = self.refresh_priorities() => {
                    if res.is_none() {
                        debug!("refresh already running");
                    }
                }
            }
        }
    }
}

/// Time left until the next minute boundary.
fn until_next_minute(now: DateTime<Utc>) -> StdDuration {
    let next = floor(now, Granularity::Minute) + Duration::minutes(1);
    (next - now).to_std().unwrap_or(StdDuration::ZERO)
}
