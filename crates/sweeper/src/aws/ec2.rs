//! EC2 kinds that need more than a single delete call.
use std::collections::BTreeMap;

use crate::{
    config::Retry,
    invoke::{Call, Invoke},
    kind::ResourceKind,
    ops::{Delete, DeleteRequest},
    outcome::DeletionOutcome,
};

use super::{invoke_with_retry, strings_at};

/// Terminates instances with a single batch call.
///
/// The ids are described first. Instances AWS no longer knows about, or that
/// are already terminated, are counted as failed and left out of the
/// terminate call. If the lookup itself fails every id is terminated.
/// Ids that AWS does not echo back as terminating are counted as failed.
#[derive(Clone, Copy, Debug, Default)]
pub struct Instances;

impl Instances {
    /// Current state of every instance in `ids` that AWS still reports.
    async fn states<P: Invoke>(
        &self,
        provider: &P,
        region: Option<&str>,
        ids: &[String],
    ) -> Option<BTreeMap<String, String>> {
        let call = Call::new("ec2", "describe-instances")
            .region(region)
            .values("--instance-ids", ids.iter().cloned());
        match provider.invoke(&call).await {
            Ok(payload) => Some(instance_states(&payload)),
            Err(e) => {
                log::warn!("  could not look up instances, terminating all of them: {e}");
                None
            }
        }
    }
}

/// `InstanceId -> State.Name` for every instance of a `describe-instances`
/// payload.
pub fn instance_states(payload: &serde_json::Value) -> BTreeMap<String, String> {
    payload
        .get("Reservations")
        .and_then(serde_json::Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|reservation| reservation.get("Instances"))
        .filter_map(serde_json::Value::as_array)
        .flatten()
        .filter_map(|instance| {
            let id = instance.get("InstanceId")?.as_str()?;
            let state = instance
                .get("State")
                .and_then(|state| state.get("Name"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown");
            Some((id.to_owned(), state.to_owned()))
        })
        .collect()
}

impl<P: Invoke + 'static> Delete<P> for Instances {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Instance
    }

    async fn delete(&self, request: DeleteRequest<'_, P>) -> DeletionOutcome {
        let mut outcome = DeletionOutcome::default();
        let states = self
            .states(request.provider, request.region, request.ids)
            .await;
        let live: Vec<String> = match states {
            None => request.ids.to_vec(),
            Some(states) => request
                .ids
                .iter()
                .filter(|id| match states.get(id.as_str()).map(String::as_str) {
                    None => {
                        log::warn!("  {id} was not found");
                        outcome.record((*id).clone(), false);
                        false
                    }
                    Some(state @ ("terminated" | "shutting-down")) => {
                        log::warn!("  {id} is already {state}");
                        outcome.record((*id).clone(), false);
                        false
                    }
                    Some(_) => true,
                })
                .cloned()
                .collect(),
        };
        if live.is_empty() {
            log::info!("  no instance left to terminate");
            return outcome;
        }

        let call = Call::new("ec2", "terminate-instances")
            .region(request.region)
            .values("--instance-ids", live.iter().cloned());
        let terminating = match request.provider.invoke(&call).await {
            Ok(payload) => strings_at(&payload, "TerminatingInstances", "InstanceId"),
            Err(e) => {
                log::warn!("  could not terminate instances: {e}");
                for id in live {
                    outcome.record(id, false);
                }
                return outcome;
            }
        };

        for id in live {
            let ok = terminating.contains(&id);
            if ok {
                log::info!("  terminating {id}");
            } else {
                log::warn!("  {id} was not reported as terminating");
            }
            outcome.record(id, ok);
        }
        outcome
    }
}

/// Detaches internet gateways from their VPCs, then deletes them.
///
/// Detach failures are logged and otherwise ignored, the delete call decides
/// the outcome.
#[derive(Clone, Copy, Debug, Default)]
pub struct InternetGateways {
    pub retry: Retry,
}

impl InternetGateways {
    async fn attached_vpcs<P: Invoke>(&self, provider: &P, region: Option<&str>, id: &str) -> Vec<String> {
        let call = Call::new("ec2", "describe-internet-gateways")
            .region(region)
            .value("--internet-gateway-ids", id);
        match provider.invoke(&call).await {
            Ok(payload) => payload
                .get("InternetGateways")
                .and_then(|gateways| gateways.get(0))
                .map(|gateway| strings_at(gateway, "Attachments", "VpcId"))
                .unwrap_or_default(),
            Err(e) => {
                log::warn!("  could not describe {id}, deleting without detaching: {e}");
                vec![]
            }
        }
    }
}

impl<P: Invoke + 'static> Delete<P> for InternetGateways {
    fn kind(&self) -> ResourceKind {
        ResourceKind::InternetGateway
    }

    async fn delete(&self, request: DeleteRequest<'_, P>) -> DeletionOutcome {
        let mut outcome = DeletionOutcome::default();
        for id in request.ids {
            for vpc_id in self.attached_vpcs(request.provider, request.region, id).await {
                let detach = Call::new("ec2", "detach-internet-gateway")
                    .region(request.region)
                    .value("--internet-gateway-id", id)
                    .value("--vpc-id", &vpc_id);
                match request.provider.invoke(&detach).await {
                    Ok(_) => log::info!("  detached {id} from {vpc_id}"),
                    Err(e) => log::warn!("  could not detach {id} from {vpc_id}: {e}"),
                }
            }

            let call = Call::new("ec2", "delete-internet-gateway")
                .region(request.region)
                .value("--internet-gateway-id", id);
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

/// Deregisters images and then removes the EBS snapshots that backed them.
///
/// An image counts as deleted once it is deregistered. Snapshot removal is
/// best effort.
#[derive(Clone, Copy, Debug, Default)]
pub struct Images {
    pub retry: Retry,
}

impl Images {
    async fn snapshots<P: Invoke>(&self, provider: &P, region: Option<&str>, id: &str) -> Vec<String> {
        let call = Call::new("ec2", "describe-images")
            .region(region)
            .value("--image-ids", id);
        match provider.invoke(&call).await {
            Ok(payload) => payload
                .get("Images")
                .and_then(|images| images.get(0))
                .and_then(|image| image.get("BlockDeviceMappings"))
                .and_then(serde_json::Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|mapping| {
                    mapping
                        .get("Ebs")
                        .and_then(|ebs| ebs.get("SnapshotId"))
                        .and_then(serde_json::Value::as_str)
                })
                .map(ToOwned::to_owned)
                .collect(),
            Err(e) => {
                log::warn!("  could not find snapshots of {id}: {e}");
                vec![]
            }
        }
    }
}

impl<P: Invoke + 'static> Delete<P> for Images {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Image
    }

    async fn delete(&self, request: DeleteRequest<'_, P>) -> DeletionOutcome {
        let mut outcome = DeletionOutcome::default();
        for id in request.ids {
            // Snapshots have to be looked up while the image still exists.
            let snapshots = self.snapshots(request.provider, request.region, id).await;

            let call = Call::new("ec2", "deregister-image")
                .region(request.region)
                .value("--image-id", id);
            let deregistered =
                invoke_with_retry(request.provider, &call, self.retry, request.shutdown).await;
            if let Err(e) = deregistered {
                log::warn!("  could not deregister {id}: {e}");
                outcome.record(id.clone(), false);
                continue;
            }
            log::info!("  deregistered {id}");
            outcome.record(id.clone(), true);

            for snapshot_id in snapshots {
                let call = Call::new("ec2", "delete-snapshot")
                    .region(request.region)
                    .value("--snapshot-id", &snapshot_id);
                match request.provider.invoke(&call).await {
                    Ok(_) => log::info!("    deleted snapshot {snapshot_id}"),
                    Err(e) => log::warn!("    could not delete snapshot {snapshot_id}: {e}"),
                }
            }
        }
        outcome
    }
}
