//! Daemon mode: poll for pending triggers and process items concurrently.
//!
//! The `DaemonContext` is built once at daemon start and passed by reference
//! into each poll round; there is no module-level mutable state. Each round
//! enumerates pending work (remote items carrying the trigger label plus
//! stored items still mid-lifecycle), de-duplicates, and processes up to
//! `max_concurrent_items` at once — a bound independent of any single plan's
//! task concurrency. Shutdown is cooperative: the cancellation token stops
//! new dispatch and in-flight stages checkpoint before the loop exits.

use std::collections::HashSet;
use std::sync::Arc;

use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ForemanConfig;
use crate::errors::EngineResult;
use crate::item::ItemStatus;
use crate::orchestrator::{Orchestrator, Trigger};

/// Event label recorded on triggers the poll loop synthesizes itself.
const POLL_EVENT: &str = "daemon-poll";

/// Process-wide daemon state with defined teardown on the shutdown signal.
pub struct DaemonContext {
    orchestrator: Arc<Orchestrator>,
    config: Arc<ForemanConfig>,
    cancel: CancellationToken,
}

impl DaemonContext {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        config: Arc<ForemanConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            config,
            cancel,
        }
    }

    /// Enumerate pending triggers for one round: remote items carrying the
    /// trigger label (new work), then stored items still mid-lifecycle
    /// (continuing work). De-duplicated by item id; terminal and
    /// awaiting-human items are excluded — the latter only move again on an
    /// explicit single-item re-trigger.
    async fn pending_triggers(&self) -> Vec<Trigger> {
        let mut seen = HashSet::new();
        let mut triggers = Vec::new();

        match self
            .orchestrator
            .git()
            .list_triggered(&self.config.labels.trigger)
            .await
        {
            Ok(items) => {
                for item in items {
                    if seen.insert(item.id.clone()) {
                        triggers.push(Trigger::new(item.id, self.config.labels.trigger.clone()));
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to enumerate triggered items"),
        }

        for status in [ItemStatus::Pending, ItemStatus::InProgress] {
            match self.orchestrator.store().list_with_status(status).await {
                Ok(items) => {
                    for item in items {
                        if seen.insert(item.id.clone()) {
                            triggers.push(Trigger::new(item.id, POLL_EVENT));
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to list stored items"),
            }
        }

        triggers
    }

    /// Run one poll round to completion: process every pending trigger,
    /// at most `max_concurrent_items` concurrently. Returns the number of
    /// triggers processed.
    pub async fn poll_once(&self) -> usize {
        let triggers = self.pending_triggers().await;
        let count = triggers.len();

        stream::iter(triggers)
            .for_each_concurrent(self.config.engine.max_concurrent_items, |trigger| {
                let orchestrator = self.orchestrator.clone();
                let cancel = self.cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let item_id = trigger.item_id.clone();
                    match orchestrator.process(trigger, cancel).await {
                        Ok(summary) => info!(
                            item = %summary.item_id,
                            stage = %summary.stage_after,
                            outcome = %summary.outcome,
                            "Processed item"
                        ),
                        Err(e) => warn!(item = %item_id, error = %e, "Processing failed"),
                    }
                }
            })
            .await;

        count
    }
}

/// Run the poll loop until the shutdown signal fires.
///
/// The first round doubles as startup resume: items left `in_progress` by a
/// previous run are re-processed from their latest checkpoint, so completed
/// stages and succeeded tasks are never re-run.
pub async fn run_daemon(ctx: &DaemonContext) -> EngineResult<()> {
    let interrupted = ctx
        .orchestrator
        .store()
        .list_with_status(ItemStatus::InProgress)
        .await?;
    if !interrupted.is_empty() {
        info!(
            count = interrupted.len(),
            "Resuming items interrupted by the previous run"
        );
    }

    info!(
        interval_secs = ctx.config.engine.poll_interval_secs,
        max_items = ctx.config.engine.max_concurrent_items,
        "Daemon started"
    );

    loop {
        let processed = ctx.poll_once().await;
        if processed > 0 {
            info!(processed, "Poll round complete");
        }

        if ctx.cancel.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(ctx.config.engine.poll_interval()) => {}
        }
    }

    info!("Daemon stopped");
    Ok(())
}
