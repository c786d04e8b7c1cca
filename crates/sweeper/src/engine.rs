//! Drives deletion of a whole document in dependency order.
use std::{collections::BTreeSet, time::Duration};

use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Config, Pacing},
    document::ResourceDocument,
    invoke::AwsCli,
    kind::ResourceKind,
    ops::{DeleteRequest, Registry},
    outcome::{dedup_ids, DeletionOutcome},
    report::RunReport,
};

/// Sleep for `duration`, or until `shutdown` is cancelled.
async fn pause(duration: Duration, shutdown: &CancellationToken) {
    if duration.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.cancelled() => {
            log::debug!("pause cut short by shutdown");
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Report every id as deleted without invoking anything.
    pub dry_run: bool,
    /// Only these kinds, if set.
    pub only: Option<BTreeSet<ResourceKind>>,
    /// Cancel to stop the run. Invocations already in flight finish, pauses
    /// end at once and everything not yet started is skipped.
    pub shutdown: CancellationToken,
}

impl RunOptions {
    fn includes(&self, kind: ResourceKind) -> bool {
        self.only.as_ref().map_or(true, |only| only.contains(&kind))
    }
}

/// Deletes everything listed in a [`ResourceDocument`].
///
/// Kinds are processed one at a time in [`ResourceKind::DELETION_ORDER`].
/// Within a kind, up to `region_concurrency` regions run at once and their
/// outcomes are merged in region order.
pub struct Engine<P> {
    provider: P,
    registry: Registry<P>,
    pacing: Pacing,
    region_concurrency: usize,
}

impl Engine<AwsCli> {
    /// An engine that deletes with the AWS command line tool.
    pub fn aws(config: &Config, profile: Option<String>) -> Self {
        let cli = AwsCli::new(&config.aws_bin)
            .with_profile(profile)
            .with_timeout(config.call_timeout());
        Engine::new(cli, crate::aws::registry(config.retry))
            .with_pacing(config.pacing)
            .with_region_concurrency(config.region_concurrency)
    }
}

impl<P: 'static> Engine<P> {
    pub fn new(provider: P, registry: Registry<P>) -> Self {
        Self {
            provider,
            registry,
            pacing: Pacing::default(),
            region_concurrency: 1,
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_region_concurrency(mut self, region_concurrency: usize) -> Self {
        self.region_concurrency = region_concurrency.max(1);
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Delete every id in `doc`, returning what happened.
    ///
    /// Failures of individual resources never abort the run.
    pub async fn run(&self, doc: &ResourceDocument, options: &RunOptions) -> RunReport {
        let mut report = RunReport::new(options.dry_run);
        if options.dry_run {
            log::info!("dry run, nothing will be deleted");
        }

        for kind in ResourceKind::DELETION_ORDER {
            if options.shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }
            if !options.includes(kind) {
                log::trace!("skipping {kind}, not selected");
                continue;
            }

            let targets: Vec<(Option<&str>, Vec<String>)> = doc
                .targets(kind)
                .into_iter()
                .map(|(region, ids)| (region, dedup_ids(ids)))
                .collect();
            if targets.is_empty() {
                log::debug!("no {kind} to delete");
                continue;
            }

            let count: usize = targets.iter().map(|(_, ids)| ids.len()).sum();
            log::info!("deleting {count} {kind}");

            let outcomes = self.run_kind(kind, &targets, options).await;
            for ((region, ids), outcome) in targets.iter().zip(outcomes) {
                match outcome {
                    Some(outcome) => report.merge(kind, *region, outcome),
                    None => {
                        log::info!(
                            "  skipped {} {kind} in {}",
                            ids.len(),
                            region.unwrap_or("global")
                        );
                        report.interrupted = true;
                    }
                }
            }

            if !options.dry_run && !report.interrupted {
                pause(self.pacing.type_pause(), &options.shutdown).await;
            }
        }

        if report.interrupted {
            log::warn!("run interrupted, remaining resources were not attempted");
        }
        report
    }

    /// One outcome per target, in target order. `None` marks a target that
    /// was skipped because of a shutdown.
    async fn run_kind(
        &self,
        kind: ResourceKind,
        targets: &[(Option<&str>, Vec<String>)],
        options: &RunOptions,
    ) -> Vec<Option<DeletionOutcome>> {
        if options.dry_run {
            return targets
                .iter()
                .map(|(region, ids)| {
                    log::info!(
                        "  would delete {} {kind} in {}: {}",
                        ids.len(),
                        region.unwrap_or("global"),
                        ids.join(", ")
                    );
                    Some(DeletionOutcome::all_succeeded(ids))
                })
                .collect();
        }

        stream::iter(targets.iter().enumerate())
            .map(|(i, (region, ids))| async move {
                pause(self.region_delay(i), &options.shutdown).await;
                if options.shutdown.is_cancelled() {
                    return None;
                }
                Some(self.delete_in(kind, *region, ids, &options.shutdown).await)
            })
            .buffered(self.region_concurrency)
            .collect()
            .await
    }

    /// How long the `i`th region of a kind waits before it starts.
    ///
    /// The regions of the first concurrent wave are staggered one region
    /// pause apart. Later regions start when a slot frees up and wait a
    /// single pause.
    fn region_delay(&self, i: usize) -> Duration {
        let pause = self.pacing.region_pause();
        match i {
            0 => Duration::ZERO,
            i if i < self.region_concurrency => pause * i as u32,
            _ => pause,
        }
    }

    async fn delete_in(
        &self,
        kind: ResourceKind,
        region: Option<&str>,
        ids: &[String],
        shutdown: &CancellationToken,
    ) -> DeletionOutcome {
        log::info!(
            "  {} {kind} in {}",
            ids.len(),
            region.unwrap_or("global")
        );
        let request = DeleteRequest {
            provider: &self.provider,
            region,
            ids,
            shutdown,
        };
        let mut outcome = match self.registry.delete(kind, request).await {
            Some(outcome) => outcome,
            None => {
                log::error!("no operation deletes {kind}, counting {} as failed", ids.len());
                DeletionOutcome::all_failed(ids)
            }
        };
        if outcome.reconcile(ids) {
            log::warn!("  the {kind} operation misreported its ids, corrected");
        }
        log::info!(
            "  {}/{} {kind} deleted in {}",
            outcome.succeeded.len(),
            ids.len(),
            region.unwrap_or("global")
        );
        outcome
    }
}
