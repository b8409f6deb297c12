//! Outer cycle loop: session lifecycle, backoff on failure, inter-cycle delay.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use zeepsync_core::SortOrder;

use crate::{CycleStats, SyncEngine};

/// Exponential backoff between failed cycles. No upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleBackoff {
    base: Duration,
    current: Duration,
}

impl CycleBackoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            current: base,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn on_success(&mut self) {
        self.current = self.base;
    }

    /// Delay to wait now; the next failure waits twice as long.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2);
        delay
    }
}

fn log_cycle_finished(cycle: u64, stats: &CycleStats) {
    info!(
        cycle,
        pages = stats.pages,
        items_seen = stats.items_seen,
        items_acquired = stats.items_acquired,
        created = stats.created,
        replaced = stats.replaced,
        touched = stats.touched,
        skipped = stats.skipped,
        deleted = stats.deleted,
        quarantine_touches = stats.quarantine_touches,
        file_failures = stats.file_failures,
        item_failures = stats.item_failures,
        consistency_failures = stats.consistency_failures,
        "cycle finished"
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Backoff(Duration),
}

impl SyncEngine {
    /// One full cycle: open a session, run both passes, always close the session.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleStats> {
        let mut stats = CycleStats::default();
        let result = self.run_passes(cancel, &mut stats).await;
        if let Err(err) = self.collab.acquisition.dispose_session().await {
            warn!(error = %err, "failed to dispose acquisition session");
        }
        result.map(|()| stats)
    }

    async fn run_passes(&self, cancel: &CancellationToken, stats: &mut CycleStats) -> Result<()> {
        self.collab
            .acquisition
            .init_session()
            .await
            .context("initialising acquisition session")?;

        for order in SortOrder::ALL {
            if cancel.is_cancelled() {
                break;
            }
            let stop = self
                .run_pass(order, cancel, stats)
                .instrument(info_span!("pass", pass = %order))
                .await?;
            info!(pass = %order, ?stop, "pass finished");
        }
        Ok(())
    }
}

/// Runs cycles until cancelled, moving Idle -> Running -> Idle or Backoff.
pub struct Supervisor {
    engine: SyncEngine,
    backoff: CycleBackoff,
    cycle_delay: Duration,
    phase: Phase,
    cycles: u64,
}

impl Supervisor {
    pub fn new(engine: SyncEngine, backoff_base: Duration, cycle_delay: Duration) -> Self {
        Self {
            engine,
            backoff: CycleBackoff::new(backoff_base),
            cycle_delay,
            phase: Phase::Idle,
            cycles: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn backoff(&self) -> &CycleBackoff {
        &self.backoff
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Apply a cycle outcome and return how long to sleep before the next one.
    pub fn complete_cycle(&mut self, succeeded: bool) -> Duration {
        if succeeded {
            self.backoff.on_success();
            self.phase = Phase::Idle;
            self.cycle_delay
        } else {
            let delay = self.backoff.on_failure();
            self.phase = Phase::Backoff(delay);
            delay
        }
    }

    pub async fn run_until_cancelled(&mut self, cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            self.phase = Phase::Running;
            self.cycles += 1;
            let span = info_span!("cycle", cycle = self.cycles);
            let outcome = self.engine.run_cycle(cancel).instrument(span).await;

            let delay = match outcome {
                Ok(stats) => {
                    log_cycle_finished(self.cycles, &stats);
                    self.complete_cycle(true)
                }
                Err(err) => {
                    let delay = self.complete_cycle(false);
                    error!(
                        cycle = self.cycles,
                        error = %format!("{err:#}"),
                        backoff_secs = delay.as_secs(),
                        "cycle failed, backing off"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break,
            }
        }
        self.phase = Phase::Idle;
        info!(cycles = self.cycles, "supervisor stopped");
    }
}
