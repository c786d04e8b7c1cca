use std::{
    cell::{Cell, RefCell},
    collections::BTreeSet,
    rc::Rc,
    time::Duration,
};

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{
    aws,
    config::{Pacing, Retry},
    document::ResourceDocument,
    engine::{Engine, RunOptions},
    invoke::{Call, CallError, Invoke},
    kind::ResourceKind,
    ops::{Delete, DeleteRequest, Registry},
    outcome::DeletionOutcome,
};

pub fn ids(xs: &[&str]) -> Vec<String> {
    xs.iter().map(|x| x.to_string()).collect()
}

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

type Respond = Box<dyn Fn(&Call) -> Option<serde_json::Value>>;
type FailWhen = Box<dyn Fn(&Call) -> bool>;

/// An in-memory provider that records every call.
///
/// Calls succeed with `Null` unless a response or a failure is scripted.
pub struct Scripted {
    calls: RefCell<Vec<Call>>,
    respond: Respond,
    fail_when: FailWhen,
    fail_first: Cell<usize>,
}

impl Scripted {
    pub fn new() -> Self {
        Self {
            calls: Default::default(),
            respond: Box::new(|_| None),
            fail_when: Box::new(|_| false),
            fail_first: Cell::new(0),
        }
    }

    /// Payload to return for a call, `None` falls back to `Null`.
    pub fn respond_with(
        mut self,
        respond: impl Fn(&Call) -> Option<serde_json::Value> + 'static,
    ) -> Self {
        self.respond = Box::new(respond);
        self
    }

    pub fn fail_when(mut self, fail_when: impl Fn(&Call) -> bool + 'static) -> Self {
        self.fail_when = Box::new(fail_when);
        self
    }

    /// Fail the next `n` calls, whatever they are.
    pub fn fail_first(self, n: usize) -> Self {
        self.fail_first.set(n);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    /// `"service operation"` of every call so far.
    pub fn operations(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(|call| format!("{} {}", call.service, call.operation))
            .collect()
    }
}

impl Invoke for Scripted {
    async fn invoke(&self, call: &Call) -> Result<serde_json::Value, CallError> {
        log::trace!("scripted {call}");
        self.calls.borrow_mut().push(call.clone());
        let remaining = self.fail_first.get();
        if remaining > 0 || (self.fail_when)(call) {
            self.fail_first.set(remaining.saturating_sub(1));
            return Err(CallError::Failed {
                call: call.to_string(),
                code: Some(254),
                stderr: "scripted failure".to_owned(),
            });
        }
        Ok((self.respond)(call).unwrap_or(serde_json::Value::Null))
    }
}

/// One invocation seen by a [`Recording`] operation.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Seen {
    kind: ResourceKind,
    region: Option<String>,
    ids: Vec<String>,
}

type Journal = Rc<RefCell<Vec<Seen>>>;

/// A fake operation that writes down what it was asked to delete.
struct Recording {
    kind: ResourceKind,
    journal: Journal,
    fail: BTreeSet<String>,
    delay: Option<(String, Duration)>,
    on_call: Option<CancellationToken>,
    misreport: bool,
}

impl Recording {
    fn new(kind: ResourceKind, journal: &Journal) -> Self {
        Self {
            kind,
            journal: journal.clone(),
            fail: Default::default(),
            delay: None,
            on_call: None,
            misreport: false,
        }
    }

    fn failing(mut self, ids: &[&str]) -> Self {
        self.fail = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    fn slow_in(mut self, region: &str, delay: Duration) -> Self {
        self.delay = Some((region.to_owned(), delay));
        self
    }

    fn triggering(mut self, shutdown: &CancellationToken) -> Self {
        self.on_call = Some(shutdown.clone());
        self
    }

    fn misreporting(mut self) -> Self {
        self.misreport = true;
        self
    }
}

impl<P: 'static> Delete<P> for Recording {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn delete(&self, request: DeleteRequest<'_, P>) -> DeletionOutcome {
        if let Some((region, delay)) = &self.delay {
            if request.region == Some(region.as_str()) {
                tokio::time::sleep(*delay).await;
            }
        }
        self.journal.borrow_mut().push(Seen {
            kind: self.kind,
            region: request.region.map(ToOwned::to_owned),
            ids: request.ids.to_vec(),
        });
        if let Some(shutdown) = &self.on_call {
            shutdown.cancel();
        }

        let mut outcome = DeletionOutcome::default();
        for id in request.ids {
            outcome.record(id.clone(), !self.fail.contains(id));
        }
        if self.misreport {
            outcome.succeeded.push("not-requested".to_owned());
            outcome.succeeded.extend(outcome.failed.iter().cloned());
        }
        outcome
    }
}

fn recording_registry(journal: &Journal) -> Registry<()> {
    let mut registry = Registry::new();
    for kind in ResourceKind::DELETION_ORDER {
        registry.register(Recording::new(kind, journal));
    }
    registry
}

fn doc(toml: &str) -> ResourceDocument {
    ResourceDocument::from_toml_str(toml).unwrap()
}

const MIXED: &str = r#"
[regions.us-east-1.vpc]
resource_ids = ["vpc-1"]

[regions.us-east-1.ec2]
resource_ids = ["i-1", "i-2"]

[global_s3]
resource_ids = ["bucket-1"]

[regions.eu-west-1.subnet]
resource_ids = ["subnet-1", "subnet-1"]

[regions.eu-west-1.sg]
resource_ids = ["sg-1"]
"#;

#[tokio::test]
async fn instances_are_terminated_before_their_vpc() {
    init_logging();
    let provider = Scripted::new().respond_with(|call| {
        if call.is("ec2", "describe-instances") {
            return Some(json!({
                "Reservations": [{"Instances": [
                    {"InstanceId": "i-1", "State": {"Name": "running"}},
                    {"InstanceId": "i-2", "State": {"Name": "stopped"}}
                ]}]
            }));
        }
        call.is("ec2", "terminate-instances").then(|| {
            json!({
                "TerminatingInstances": [{"InstanceId": "i-1"}, {"InstanceId": "i-2"}]
            })
        })
    });
    let engine = Engine::new(provider, aws::registry(Retry::default())).with_pacing(Pacing::none());
    let report = engine
        .run(
            &doc(
                r#"
                [regions.us-east-1.vpc]
                resource_ids = ["vpc-1"]
                [regions.us-east-1.ec2]
                resource_ids = ["i-1", "i-2"]
                "#,
            ),
            &RunOptions::default(),
        )
        .await;

    assert_eq!(
        vec![
            "ec2 describe-instances",
            "ec2 terminate-instances",
            "ec2 delete-vpc"
        ],
        engine.provider().operations()
    );
    assert_eq!(3, report.total_attempted);
    assert_eq!(3, report.total_succeeded);
    assert!(!report.has_failures());
}

#[tokio::test]
async fn empty_document_makes_no_calls() {
    init_logging();
    let engine = Engine::new(Scripted::new(), aws::registry(Retry::default()));
    let report = engine
        .run(&doc("[metadata]\nprofile = \"ops\"\n"), &RunOptions::default())
        .await;
    assert!(engine.provider().calls().is_empty());
    assert_eq!(0, report.total_attempted);
    assert!(report.by_kind.is_empty());
}

#[tokio::test]
async fn kinds_run_in_deletion_order_whatever_the_document_order() {
    init_logging();
    let journal = Journal::default();
    let engine = Engine::new((), recording_registry(&journal)).with_pacing(Pacing::none());
    let report = engine.run(&doc(MIXED), &RunOptions::default()).await;

    let seen: Vec<_> = journal.borrow().iter().map(|seen| seen.kind).collect();
    assert_eq!(
        vec![
            ResourceKind::Instance,
            ResourceKind::SecurityGroup,
            ResourceKind::Subnet,
            ResourceKind::Vpc,
            ResourceKind::Bucket,
        ],
        seen
    );
    let priorities: Vec<_> = seen.iter().map(|kind| kind.deletion_priority()).collect();
    let mut sorted = priorities.clone();
    sorted.sort();
    assert_eq!(sorted, priorities);

    // duplicates are handed over once
    assert_eq!(
        ids(&["subnet-1"]),
        journal.borrow()[2].ids,
        "duplicate ids should be removed"
    );
    assert_eq!(None, journal.borrow()[4].region);
    assert_eq!(6, report.total_attempted);
}

#[tokio::test]
async fn allow_list_limits_the_kinds_deleted() {
    init_logging();
    let engine = Engine::new(Scripted::new(), aws::registry(Retry::default()))
        .with_pacing(Pacing::none());
    let options = RunOptions {
        only: Some([ResourceKind::Subnet].into_iter().collect()),
        ..Default::default()
    };
    let report = engine.run(&doc(MIXED), &options).await;

    assert_eq!(vec!["ec2 delete-subnet"], engine.provider().operations());
    assert_eq!(1, report.total_attempted);
    assert_eq!(
        vec![ResourceKind::Subnet],
        report.by_kind.keys().copied().collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn dry_run_never_calls_out_and_never_waits() {
    init_logging();
    let pacing = Pacing {
        region_pause_ms: 3_600_000,
        type_pause_ms: 3_600_000,
    };
    let engine = Engine::new(Scripted::new(), aws::registry(Retry::default())).with_pacing(pacing);
    let options = RunOptions {
        dry_run: true,
        ..Default::default()
    };
    let report = tokio::time::timeout(
        Duration::from_secs(5),
        engine.run(&doc(MIXED), &options),
    )
    .await
    .expect("a dry run should not pause");

    assert!(engine.provider().calls().is_empty());
    assert!(report.dry_run);
    assert_eq!(6, report.total_attempted);
    assert_eq!(6, report.total_succeeded);
    assert_eq!(0, report.total_failed);
}

#[tokio::test]
async fn outcomes_partition_the_ids_under_failures() {
    init_logging();
    let journal = Journal::default();
    let registry = recording_registry(&journal)
        .with(Recording::new(ResourceKind::Instance, &journal).failing(&["i-2"]))
        .with(Recording::new(ResourceKind::SecurityGroup, &journal).misreporting());
    let engine = Engine::new((), registry).with_pacing(Pacing::none());
    let report = engine.run(&doc(MIXED), &RunOptions::default()).await;

    assert_eq!(6, report.total_attempted);
    assert_eq!(
        report.total_attempted,
        report.total_succeeded + report.total_failed
    );
    for tally in report.by_kind.values() {
        assert_eq!(tally.attempted, tally.succeeded + tally.failed);
    }
    let failed: Vec<_> = report.failures.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(vec!["i-2"], failed);
    assert_eq!(1, report.by_kind[&ResourceKind::SecurityGroup].attempted);
}

#[tokio::test]
async fn kinds_without_an_operation_count_as_failed() {
    init_logging();
    let journal = Journal::default();
    let registry = Registry::new().with(Recording::new(ResourceKind::Vpc, &journal));
    let engine = Engine::new((), registry).with_pacing(Pacing::none());
    let report = engine.run(&doc(MIXED), &RunOptions::default()).await;

    assert_eq!(1, journal.borrow().len());
    assert_eq!(1, report.total_succeeded);
    assert_eq!(5, report.total_failed);
}

#[tokio::test]
async fn shutdown_skips_everything_not_yet_started() {
    init_logging();
    let journal = Journal::default();
    let shutdown = CancellationToken::new();
    let registry = recording_registry(&journal)
        .with(Recording::new(ResourceKind::SecurityGroup, &journal).triggering(&shutdown));
    let engine = Engine::new((), registry).with_pacing(Pacing::none());
    let options = RunOptions {
        shutdown: shutdown.clone(),
        ..Default::default()
    };
    let report = engine.run(&doc(MIXED), &options).await;

    assert!(report.interrupted);
    let seen: Vec<_> = journal.borrow().iter().map(|seen| seen.kind).collect();
    assert_eq!(
        vec![ResourceKind::Instance, ResourceKind::SecurityGroup],
        seen
    );
    assert_eq!(3, report.total_attempted);
}

#[tokio::test]
async fn shutdown_cuts_the_type_pause_short() {
    init_logging();
    let journal = Journal::default();
    let shutdown = CancellationToken::new();
    let registry = recording_registry(&journal)
        .with(Recording::new(ResourceKind::Instance, &journal).triggering(&shutdown));
    let engine = Engine::new((), registry).with_pacing(Pacing {
        region_pause_ms: 0,
        type_pause_ms: 3_600_000,
    });
    let options = RunOptions {
        shutdown: shutdown.clone(),
        ..Default::default()
    };
    let report = tokio::time::timeout(
        Duration::from_secs(3),
        engine.run(
            &doc(
                r#"
                [regions.us-east-1.ec2]
                resource_ids = ["i-1"]
                [regions.us-east-1.vpc]
                resource_ids = ["vpc-1"]
                "#,
            ),
            &options,
        ),
    )
    .await
    .expect("the pause should end on shutdown");

    assert!(report.interrupted);
    let seen: Vec<_> = journal.borrow().iter().map(|seen| seen.kind).collect();
    assert_eq!(vec![ResourceKind::Instance], seen);
    assert_eq!(1, report.total_attempted);
}

#[tokio::test]
async fn concurrent_regions_start_a_region_pause_apart() {
    init_logging();
    let journal = Journal::default();
    let registry = Registry::new().with(Recording::new(ResourceKind::Vpc, &journal));
    let engine = Engine::new((), registry)
        .with_pacing(Pacing {
            region_pause_ms: 40,
            type_pause_ms: 0,
        })
        .with_region_concurrency(3);
    let started = tokio::time::Instant::now();
    engine
        .run(
            &doc(
                r#"
                [regions.us-west-2.vpc]
                resource_ids = ["vpc-c"]
                [regions.ap-south-1.vpc]
                resource_ids = ["vpc-a"]
                [regions.eu-west-1.vpc]
                resource_ids = ["vpc-b"]
                "#,
            ),
            &RunOptions::default(),
        )
        .await;

    assert!(started.elapsed() >= Duration::from_millis(80));
    let regions: Vec<_> = journal
        .borrow()
        .iter()
        .filter_map(|seen| seen.region.clone())
        .collect();
    assert_eq!(vec!["ap-south-1", "eu-west-1", "us-west-2"], regions);
}

#[tokio::test]
async fn concurrent_regions_are_reported_in_region_order() {
    init_logging();
    let journal = Journal::default();
    let registry = Registry::new().with(
        Recording::new(ResourceKind::Vpc, &journal)
            .failing(&["vpc-a", "vpc-b", "vpc-c"])
            .slow_in("ap-south-1", Duration::from_millis(50)),
    );
    let engine = Engine::new((), registry)
        .with_pacing(Pacing::none())
        .with_region_concurrency(3);
    let report = engine
        .run(
            &doc(
                r#"
                [regions.us-west-2.vpc]
                resource_ids = ["vpc-c"]
                [regions.ap-south-1.vpc]
                resource_ids = ["vpc-a"]
                [regions.eu-west-1.vpc]
                resource_ids = ["vpc-b"]
                "#,
            ),
            &RunOptions::default(),
        )
        .await;

    // the slow region finished last
    assert_eq!(
        Some("ap-south-1"),
        journal.borrow().last().and_then(|seen| seen.region.as_deref())
    );
    let regions: Vec<_> = report
        .failures
        .iter()
        .map(|f| f.region.as_deref().unwrap_or("global"))
        .collect();
    assert_eq!(vec!["ap-south-1", "eu-west-1", "us-west-2"], regions);
}

#[tokio::test]
async fn buckets_are_purged_last_without_a_region() {
    init_logging();
    let engine = Engine::new(Scripted::new(), aws::registry(Retry::default()))
        .with_pacing(Pacing::none());
    let report = engine.run(&doc(MIXED), &RunOptions::default()).await;

    let calls = engine.provider().calls();
    let first_bucket_call = calls
        .iter()
        .position(|call| call.service == "s3" || call.service == "s3api")
        .unwrap();
    assert!(calls[first_bucket_call..]
        .iter()
        .all(|call| call.region.is_none()));
    assert!(calls[..first_bucket_call]
        .iter()
        .all(|call| call.region.is_some()));
    assert_eq!(
        Some(&"s3api delete-bucket".to_owned()),
        engine.provider().operations().last()
    );
    assert_eq!(6, report.total_attempted);
}
