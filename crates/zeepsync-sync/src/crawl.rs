//! Sorted crawl passes with the unproductive-page termination rule.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use zeepsync_adapters::probe_backend;
use zeepsync_core::{SortOrder, WorkshopItem};

use crate::{filter_candidates, CycleStats, SyncEngine};

/// Why a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStop {
    /// Every page up to the reported total was visited.
    Exhausted,
    /// The consecutive unproductive page limit was reached.
    Unproductive,
    Cancelled,
    /// The liveness probe failed; the pass did not start.
    ProbeFailed,
}

/// Tracks consecutive pages on which no item was productive.
#[derive(Debug, Clone, Copy)]
pub struct UnproductiveStreak {
    limit: u32,
    current: u32,
}

impl UnproductiveStreak {
    pub fn new(limit: u32) -> Self {
        Self { limit, current: 0 }
    }

    /// Record one page; returns true once the limit is reached.
    pub fn record(&mut self, productive: bool) -> bool {
        if productive {
            self.current = 0;
        } else {
            self.current += 1;
        }
        self.current >= self.limit
    }

    pub fn current(&self) -> u32 {
        self.current
    }
}

impl SyncEngine {
    pub async fn run_pass(
        &self,
        order: SortOrder,
        cancel: &CancellationToken,
        stats: &mut CycleStats,
    ) -> Result<PassStop> {
        if cancel.is_cancelled() {
            return Ok(PassStop::Cancelled);
        }

        if let Err(err) = probe_backend(self.collab.backend.as_ref(), order).await {
            warn!(error = %err, "backend liveness probe failed, skipping pass");
            return Ok(PassStop::ProbeFailed);
        }

        let total_pages = self
            .collab
            .catalog
            .total_pages(order)
            .await
            .with_context(|| format!("querying total pages for {order} pass"))?;
        info!(total_pages, "starting pass");

        let mut streak = UnproductiveStreak::new(self.settings.unproductive_page_limit);
        let mut page = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(PassStop::Cancelled);
            }
            if page > total_pages {
                return Ok(PassStop::Exhausted);
            }

            let items = self
                .collab
                .catalog
                .page(page, order)
                .await
                .with_context(|| format!("fetching page {page} of {order} pass"))?;
            stats.pages += 1;

            let productive = self
                .process_page(items, cancel, stats)
                .instrument(info_span!("page", page))
                .await;
            if streak.record(productive) {
                info!(page, streak = streak.current(), "unproductive page limit reached");
                return Ok(PassStop::Unproductive);
            }
            page += 1;
        }
    }

    /// Returns whether any item on the page was productive.
    async fn process_page(
        &self,
        items: Vec<WorkshopItem>,
        cancel: &CancellationToken,
        stats: &mut CycleStats,
    ) -> bool {
        stats.items_seen += items.len() as u64;
        let candidates = filter_candidates(self.collab.backend.as_ref(), items).await;
        debug!(candidates = candidates.len(), "filtered page");

        let mut productive = false;
        for item in candidates {
            if cancel.is_cancelled() {
                break;
            }
            let span = info_span!("item", workshop_id = %item.id);
            match self.process_item(&item, cancel, stats).instrument(span).await {
                Ok(report) => productive |= report.is_productive(),
                Err(err) => {
                    warn!(workshop_id = %item.id, error = %format!("{err:#}"), "item failed");
                    stats.item_failures += 1;
                    productive = true;
                }
            }
        }
        productive
    }
}
