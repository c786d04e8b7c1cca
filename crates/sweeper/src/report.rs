//! Run reports.
use std::collections::BTreeMap;

use colored::Colorize;

use crate::{kind::ResourceKind, outcome::DeletionOutcome};

/// Counts for a single kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Tally {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// A resource that could not be deleted.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Failure {
    pub kind: ResourceKind,
    /// `None` for global resources.
    pub region: Option<String>,
    pub id: String,
}

/// The aggregated result of a run.
///
/// Built up by the engine one [`DeletionOutcome`] at a time and only read
/// once the run is over. `total_attempted` is always
/// `total_succeeded + total_failed`.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    /// The run was stopped early and some resources were never attempted.
    pub interrupted: bool,
    pub total_attempted: usize,
    pub total_succeeded: usize,
    pub total_failed: usize,
    pub by_kind: BTreeMap<ResourceKind, Tally>,
    pub failures: Vec<Failure>,
}

impl RunReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Default::default()
        }
    }

    /// Fold one outcome into the report.
    pub fn merge(&mut self, kind: ResourceKind, region: Option<&str>, outcome: DeletionOutcome) {
        let tally = self.by_kind.entry(kind).or_default();
        tally.attempted += outcome.attempted();
        tally.succeeded += outcome.succeeded.len();
        tally.failed += outcome.failed.len();

        self.total_attempted += outcome.attempted();
        self.total_succeeded += outcome.succeeded.len();
        self.total_failed += outcome.failed.len();

        self.failures
            .extend(outcome.failed.into_iter().map(|id| Failure {
                kind,
                region: region.map(ToOwned::to_owned),
                id,
            }));
    }

    pub fn has_failures(&self) -> bool {
        self.total_failed > 0
    }

    /// The report as pretty printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl core::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Results:")?;
        writeln!(f, "  total processed: {}", self.total_attempted)?;
        writeln!(
            f,
            "  succeeded: {}",
            self.total_succeeded.to_string().green()
        )?;
        writeln!(f, "  failed: {}", self.total_failed.to_string().red())?;
        for kind in ResourceKind::DELETION_ORDER {
            if let Some(tally) = self.by_kind.get(&kind) {
                writeln!(
                    f,
                    "    {kind}: {}/{} deleted",
                    tally.succeeded, tally.attempted
                )?;
            }
        }
        if !self.failures.is_empty() {
            writeln!(f, "  not deleted:")?;
            for failure in &self.failures {
                writeln!(
                    f,
                    "    {} {} ({})",
                    failure.kind.tag(),
                    failure.id,
                    failure.region.as_deref().unwrap_or("global")
                )?;
            }
        }
        writeln!(f)?;
        if self.interrupted {
            writeln!(
                f,
                "{}",
                "Interrupted: remaining resources were not attempted.".yellow()
            )?;
        }
        if self.dry_run {
            write!(
                f,
                "{}",
                "DRY-RUN: no resource was actually removed.".cyan().bold()
            )?;
        } else {
            write!(f, "{}", "Deletion finished.".green())?;
            if self.has_failures() {
                write!(
                    f,
                    "\n{}",
                    format!(
                        "{} resource(s) could not be deleted (check dependencies or permissions).",
                        self.total_failed
                    )
                    .yellow()
                )?;
            }
        }
        Ok(())
    }
}
