//! Deletion operations for AWS, driven through an [`Invoke`] provider.
//!
//! Most kinds are removed with one call per id. Instances, internet gateways,
//! images and buckets need extra steps and live in their own modules.
use backon::{ConstantBuilder, Retryable};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Retry,
    invoke::{Call, CallError, CancelledSnafu, Invoke},
    kind::ResourceKind,
    ops::{Delete, DeleteRequest, Registry},
    outcome::DeletionOutcome,
};

pub mod ec2;
pub mod s3;

/// A registry holding an operation for every [`ResourceKind`].
pub fn registry<P: Invoke + 'static>(retry: Retry) -> Registry<P> {
    let mut registry = Registry::new();
    registry
        .register(ec2::Instances)
        .register(ec2::InternetGateways { retry })
        .register(ec2::Images { retry })
        .register(s3::Buckets { retry });
    for kind in ResourceKind::DELETION_ORDER {
        if let Some(per_id) = PerId::for_kind(kind, retry) {
            registry.register(per_id);
        }
    }
    registry
}

/// Invoke `call`, trying again after `retry.backoff()` until
/// `retry.attempts` calls have been made.
///
/// Once `shutdown` is cancelled no further attempt is started and a pending
/// backoff is cut short.
pub async fn invoke_with_retry<P: Invoke>(
    provider: &P,
    call: &Call,
    retry: Retry,
    shutdown: &CancellationToken,
) -> Result<serde_json::Value, CallError> {
    let backoff = ConstantBuilder::default()
        .with_delay(retry.backoff())
        .with_max_times(retry.attempts.saturating_sub(1) as usize);
    let sleep_token = shutdown.clone();
    let mut attempt = 0u32;

    (|| {
        attempt += 1;
        let stopped = attempt > 1 && shutdown.is_cancelled();
        async move {
            if stopped {
                return CancelledSnafu {
                    call: call.to_string(),
                }
                .fail();
            }
            provider.invoke(call).await
        }
    })
    .retry(backoff)
    .sleep(move |delay| {
        let token = sleep_token.clone();
        async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {}
            }
        }
    })
    .when(|e| !matches!(e, CallError::Cancelled { .. }) && !shutdown.is_cancelled())
    .notify(|e, delay| {
        log::warn!(
            "  {call} failed, retrying in {}ms: {e}",
            delay.as_millis()
        );
    })
    .await
}

/// Deletes resources with one call per id, for kinds that have no batch
/// delete and no preparation steps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerId {
    kind: ResourceKind,
    service: &'static str,
    operation: &'static str,
    id_flag: &'static str,
    switches: &'static [&'static str],
    retry: Retry,
}

impl PerId {
    /// The per-id operation for `kind`, if `kind` is deleted one id at a time
    /// without any extra steps.
    pub fn for_kind(kind: ResourceKind, retry: Retry) -> Option<Self> {
        const NONE: &[&str] = &[];
        const RDS: &[&str] = &["--skip-final-snapshot", "--delete-automated-backups"];
        let (service, operation, id_flag, switches) = match kind {
            ResourceKind::SecurityGroup => ("ec2", "delete-security-group", "--group-id", NONE),
            ResourceKind::Subnet => ("ec2", "delete-subnet", "--subnet-id", NONE),
            ResourceKind::NatGateway => ("ec2", "delete-nat-gateway", "--nat-gateway-id", NONE),
            ResourceKind::RouteTable => ("ec2", "delete-route-table", "--route-table-id", NONE),
            ResourceKind::Vpc => ("ec2", "delete-vpc", "--vpc-id", NONE),
            ResourceKind::ClassicLoadBalancer => {
                ("elb", "delete-load-balancer", "--load-balancer-name", NONE)
            }
            ResourceKind::LoadBalancerV2 => {
                ("elbv2", "delete-load-balancer", "--load-balancer-arn", NONE)
            }
            ResourceKind::DbInstance => {
                ("rds", "delete-db-instance", "--db-instance-identifier", RDS)
            }
            ResourceKind::Instance
            | ResourceKind::InternetGateway
            | ResourceKind::Image
            | ResourceKind::Bucket => return None,
        };
        Some(Self {
            kind,
            service,
            operation,
            id_flag,
            switches,
            retry,
        })
    }

    pub fn call(&self, region: Option<&str>, id: &str) -> Call {
        self.switches.iter().fold(
            Call::new(self.service, self.operation)
                .region(region)
                .value(self.id_flag, id),
            |call, switch| call.switch(*switch),
        )
    }
}

impl<P: Invoke + 'static> Delete<P> for PerId {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn delete(&self, request: DeleteRequest<'_, P>) -> DeletionOutcome {
        let mut outcome = DeletionOutcome::default();
        for id in request.ids {
            let call = self.call(request.region, id);
            let deleted =
                invoke_with_retry(request.provider, &call, self.retry, request.shutdown).await;
            match deleted {
                Ok(_) => {
                    log::info!("  deleted {id}");
                    outcome.record(id.clone(), true);
                }
                Err(e) => {
                    log::warn!("  could not delete {id}: {e}");
                    outcome.record(id.clone(), false);
                }
            }
        }
        outcome
    }
}

/// Collects `value[key][..][field]` strings, skipping anything missing.
pub(crate) fn strings_at(value: &serde_json::Value, key: &str, field: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(serde_json::Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get(field).and_then(serde_json::Value::as_str))
        .map(ToOwned::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{ids, Scripted};
    use pretty_assertions::assert_eq;

    #[test]
    fn every_kind_has_an_operation() {
        let registry = registry::<Scripted>(Retry::default());
        for kind in ResourceKind::DELETION_ORDER {
            assert!(registry.contains(kind), "{kind:?} has no operation");
        }
    }

    #[test]
    fn rds_call_skips_final_snapshot() {
        let per_id = PerId::for_kind(ResourceKind::DbInstance, Retry::default()).unwrap();
        let call = per_id.call(Some("us-east-1"), "db-1");
        assert!(call.is("rds", "delete-db-instance"));
        assert_eq!(Some("db-1"), call.get_one("--db-instance-identifier"));
        assert!(call.args.contains(&crate::invoke::Arg::Switch("--skip-final-snapshot")));
        assert!(call
            .args
            .contains(&crate::invoke::Arg::Switch("--delete-automated-backups")));
    }

    #[tokio::test]
    async fn per_id_failures_do_not_stop_the_batch() {
        let provider =
            Scripted::new().fail_when(|call| call.get_one("--subnet-id") == Some("subnet-2"));
        let per_id = PerId::for_kind(ResourceKind::Subnet, Retry::default()).unwrap();
        let input = ids(&["subnet-1", "subnet-2", "subnet-3"]);
        let outcome = per_id
            .delete(DeleteRequest {
                provider: &provider,
                region: Some("us-east-1"),
                ids: &input,
                shutdown: &CancellationToken::new(),
            })
            .await;
        assert_eq!(ids(&["subnet-1", "subnet-3"]), outcome.succeeded);
        assert_eq!(ids(&["subnet-2"]), outcome.failed);
        assert_eq!(3, provider.calls().len());
    }

    #[tokio::test]
    async fn retry_repeats_a_failing_call_until_it_succeeds() {
        let provider = Scripted::new().fail_first(2);
        let retry = Retry {
            attempts: 3,
            backoff_ms: 0,
        };
        let per_id = PerId::for_kind(ResourceKind::Vpc, retry).unwrap();
        let input = ids(&["vpc-1"]);
        let outcome = per_id
            .delete(DeleteRequest {
                provider: &provider,
                region: Some("us-east-1"),
                ids: &input,
                shutdown: &CancellationToken::new(),
            })
            .await;
        assert_eq!(ids(&["vpc-1"]), outcome.succeeded);
        assert_eq!(3, provider.calls().len());
    }

    #[tokio::test]
    async fn retry_gives_up_after_the_configured_attempts() {
        let provider = Scripted::new().fail_when(|_| true);
        let retry = Retry {
            attempts: 2,
            backoff_ms: 0,
        };
        let per_id = PerId::for_kind(ResourceKind::Vpc, retry).unwrap();
        let input = ids(&["vpc-1"]);
        let outcome = per_id
            .delete(DeleteRequest {
                provider: &provider,
                region: Some("us-east-1"),
                ids: &input,
                shutdown: &CancellationToken::new(),
            })
            .await;
        assert_eq!(ids(&["vpc-1"]), outcome.failed);
        assert_eq!(2, provider.calls().len());
    }

    #[tokio::test]
    async fn shutdown_cuts_a_pending_backoff_short() {
        crate::test::init_logging();
        let provider = Scripted::new().fail_when(|_| true);
        let retry = Retry {
            attempts: 5,
            backoff_ms: 3_600_000,
        };
        let shutdown = CancellationToken::new();
        let call = Call::new("ec2", "delete-vpc").value("--vpc-id", "vpc-1");
        let (result, ()) = tokio::time::timeout(std::time::Duration::from_secs(3), async {
            tokio::join!(
                invoke_with_retry(&provider, &call, retry, &shutdown),
                async {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    shutdown.cancel();
                }
            )
        })
        .await
        .expect("the backoff was not cut short");
        assert!(matches!(result, Err(CallError::Cancelled { .. })), "{result:?}");
        assert_eq!(1, provider.calls().len());
    }

    #[tokio::test]
    async fn a_cancelled_run_makes_a_single_attempt() {
        let provider = Scripted::new().fail_when(|_| true);
        let retry = Retry {
            attempts: 3,
            backoff_ms: 0,
        };
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let call = Call::new("ec2", "delete-vpc").value("--vpc-id", "vpc-1");
        let result = invoke_with_retry(&provider, &call, retry, &shutdown).await;
        assert!(matches!(result, Err(CallError::Failed { .. })));
        assert_eq!(1, provider.calls().len());
    }
}
