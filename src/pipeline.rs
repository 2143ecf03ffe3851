use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collector::Collector;
use crate::dedup::{ConceptHistoryWindow, DedupChecker};
use crate::generation::{DraftOutcome, GenerationPipeline};
use crate::publisher::Publisher;
use crate::scheduler::Scheduler;
use crate::selector::{CandidateSelector, ContentMix};
use crate::store::Store;
use crate::types::{DedupVerdict, DeniedReason, Gate};

/// Pipeline stage a failure is attributed to, so ingestion failures are
/// distinguishable from generation and publish failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Collection,
    Store,
    Generation,
    Publish,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Collection => "collection",
            Stage::Store => "store",
            Stage::Generation => "generation",
            Stage::Publish => "publish",
        };
        f.write_str(s)
    }
}

/// Outcome of one timer-driven cycle. Denials and skips are expected; only
/// `Failed` is an operational problem.
#[derive(Debug)]
pub enum CycleReport {
    Collected { new_items: usize },
    Posted { post_ids: Vec<Uuid> },
    Denied(DeniedReason),
    Skipped { reason: String },
    Failed { stage: Stage, error: String },
    Cancelled,
}

/// Wires the components into the sequential per-cycle chain: collect ->
/// select -> dedup -> gate -> generate -> publish. Collection and
/// generation run on independent timers; the scheduler's cycle lock keeps
/// concurrent generation cycles from both passing the gate.
pub struct BotPipeline {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    collector: Collector,
    selector: CandidateSelector,
    dedup: DedupChecker,
    generation: GenerationPipeline,
    publisher: Publisher,
    dedup_window_size: usize,
    /// How many ranked candidates one cycle will attempt before giving up.
    candidate_batch: usize,
    shutdown: watch::Receiver<bool>,
}

impl BotPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        collector: Collector,
        selector: CandidateSelector,
        dedup: DedupChecker,
        generation: GenerationPipeline,
        publisher: Publisher,
        dedup_window_size: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            scheduler,
            collector,
            selector,
            dedup,
            generation,
            publisher,
            dedup_window_size,
            candidate_batch: 5,
            shutdown,
        }
    }

    pub async fn run_collection_cycle(&self) -> CycleReport {
        if self.is_cancelled() {
            return CycleReport::Cancelled;
        }
        match self.collector.collect(Utc::now()).await {
            Ok(items) => CycleReport::Collected {
                new_items: items.len(),
            },
            Err(e) => CycleReport::Failed {
                stage: Stage::Collection,
                error: e.to_string(),
            },
        }
    }

    pub async fn run_generation_cycle(&self) -> CycleReport {
        if self.is_cancelled() {
            return CycleReport::Cancelled;
        }

        // Held until the publish either happens or is abandoned, so no
        // concurrent cycle can pass the gate in between.
        let _cycle = self.scheduler.lock_cycle().await;

        let now = Utc::now();
        if let Gate::Denied(reason) = self.scheduler.can_post_now(now).await {
            return CycleReport::Denied(reason);
        }

        if self.is_cancelled() {
            return CycleReport::Cancelled;
        }

        let history = match self.store.recent_posts(self.dedup_window_size).await {
            Ok(posts) => posts,
            Err(e) => {
                return CycleReport::Failed {
                    stage: Stage::Store,
                    error: e.to_string(),
                }
            }
        };
        let window = ConceptHistoryWindow::from_posts(&history);
        let mix = ContentMix::from_posts(&history);

        let (items, known_ids) = match tokio::try_join!(
            self.store.unused_source_items(self.candidate_batch * 4),
            self.store.cached_source_ids(),
        ) {
            Ok(pair) => pair,
            Err(e) => {
                return CycleReport::Failed {
                    stage: Stage::Store,
                    error: e.to_string(),
                }
            }
        };

        let ranked = self.selector.select(items, &mix);
        if ranked.is_empty() {
            return CycleReport::Skipped {
                reason: "no eligible candidates".to_string(),
            };
        }

        for (item, rationale) in ranked.into_iter().take(self.candidate_batch) {
            if self.is_cancelled() {
                return CycleReport::Cancelled;
            }

            // Hard exclusion: never cover the same vulnerability record twice.
            if window.covers_cve(&item.id) {
                continue;
            }

            debug!(
                cve = %item.id,
                score = rationale.score,
                reasons = ?rationale.reasons,
                "Attempting candidate"
            );

            let draft = match self.generation.produce(&item, &history, &known_ids).await {
                Ok(DraftOutcome::Approved(draft)) => draft,
                Ok(DraftOutcome::Abandoned { reason }) => {
                    return CycleReport::Failed {
                        stage: Stage::Generation,
                        error: reason,
                    };
                }
                Err(e) => {
                    return CycleReport::Failed {
                        stage: Stage::Generation,
                        error: e.to_string(),
                    };
                }
            };

            match self
                .dedup
                .is_allowed(&window, &draft.concepts, draft.technical_depth)
            {
                DedupVerdict::Rejected { overlap } => {
                    info!(cve = %item.id, overlap, "Candidate rejected by dedup");
                    continue;
                }
                DedupVerdict::Allowed => {}
            }

            return match self.publisher.publish(&draft, now).await {
                Ok(records) => CycleReport::Posted {
                    post_ids: records.iter().map(|r| r.id).collect(),
                },
                Err(e) => CycleReport::Failed {
                    stage: Stage::Publish,
                    error: e.to_string(),
                },
            };
        }

        CycleReport::Skipped {
            reason: "no suitable content generated".to_string(),
        }
    }

    /// Run both timer loops until shutdown is signalled. A cycle in flight
    /// finishes its current stage before the cancellation checkpoint stops
    /// it; nothing is resumed after cancellation.
    pub async fn run(
        self: Arc<Self>,
        collect_every: StdDuration,
        generate_every: StdDuration,
    ) {
        let collection = {
            let pipeline = self.clone();
            tokio::spawn(async move {
                let mut ticker = interval(collect_every);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let report = pipeline.run_collection_cycle().await;
                            pipeline.log_report("collection", &report);
                            if matches!(report, CycleReport::Cancelled) {
                                break;
                            }
                        }
                        () = pipeline.wait_shutdown() => break,
                    }
                }
            })
        };

        let generation = {
            let pipeline = self.clone();
            tokio::spawn(async move {
                let mut ticker = interval(generate_every);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let report = pipeline.run_generation_cycle().await;
                            pipeline.log_report("generation", &report);
                            if matches!(report, CycleReport::Cancelled) {
                                break;
                            }
                        }
                        () = pipeline.wait_shutdown() => break,
                    }
                }
            })
        };

        let _ = tokio::join!(collection, generation);
        info!("Pipeline stopped");
    }

    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn wait_shutdown(&self) {
        let mut rx = self.shutdown.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    fn log_report(&self, cycle: &str, report: &CycleReport) {
        match report {
            CycleReport::Collected { new_items } => {
                info!(cycle, new_items, "Cycle complete");
            }
            CycleReport::Posted { post_ids } => {
                info!(cycle, posts = post_ids.len(), "Cycle published");
            }
            CycleReport::Denied(reason) => {
                debug!(cycle, %reason, "Cycle gated");
            }
            CycleReport::Skipped { reason } => {
                info!(cycle, reason, "Cycle skipped");
            }
            CycleReport::Failed { stage, error } => {
                error!(cycle, %stage, error, "Cycle failed");
            }
            CycleReport::Cancelled => {
                warn!(cycle, "Cycle cancelled");
            }
        }
    }
}
