//! Per-invocation deletion results.
use std::collections::HashSet;

/// The result of deleting one batch of resources of a single kind.
///
/// `succeeded` and `failed` are disjoint, duplicate free, and together hold
/// every id that was handed to the operation.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct DeletionOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

impl DeletionOutcome {
    /// Every id succeeded.
    pub fn all_succeeded(ids: &[String]) -> Self {
        Self {
            succeeded: ids.to_vec(),
            failed: vec![],
        }
    }

    /// Every id failed.
    pub fn all_failed(ids: &[String]) -> Self {
        Self {
            succeeded: vec![],
            failed: ids.to_vec(),
        }
    }

    /// Record one id.
    pub fn record(&mut self, id: impl Into<String>, ok: bool) {
        if ok {
            self.succeeded.push(id.into());
        } else {
            self.failed.push(id.into());
        }
    }

    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Force this outcome into an exact partition of `ids`.
    ///
    /// Ids that were not requested are dropped, ids missing from both lists
    /// and ids reported in both lists are counted as failed. `ids` must be
    /// duplicate free. Returns `true` if the outcome had to be corrected.
    pub fn reconcile(&mut self, ids: &[String]) -> bool {
        let requested: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let succeeded: HashSet<&str> = self.succeeded.iter().map(String::as_str).collect();
        let failed: HashSet<&str> = self.failed.iter().map(String::as_str).collect();

        let valid = succeeded.len() == self.succeeded.len()
            && failed.len() == self.failed.len()
            && succeeded.is_disjoint(&failed)
            && self.attempted() == requested.len()
            && succeeded.iter().chain(failed.iter()).all(|id| requested.contains(id));

        let mut reconciled = DeletionOutcome::default();
        for id in ids {
            let ok = succeeded.contains(id.as_str()) && !failed.contains(id.as_str());
            reconciled.record(id.clone(), ok);
        }
        *self = reconciled;
        !valid
    }
}

/// Removes duplicate ids, keeping the first occurrence.
pub fn dedup_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}
