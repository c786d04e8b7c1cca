//! S3 buckets.
//!
//! A bucket can only be deleted once it is empty, including every object
//! version and delete marker of a versioned bucket.
use crate::{
    config::Retry,
    invoke::{Call, Invoke},
    kind::ResourceKind,
    ops::{Delete, DeleteRequest},
    outcome::DeletionOutcome,
};

use super::invoke_with_retry;

/// An object version or delete marker that has to go before its bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectVersion {
    pub key: String,
    pub version_id: String,
}

/// Read `Versions` and `DeleteMarkers` out of a `list-object-versions` payload.
pub fn object_versions(payload: &serde_json::Value) -> Vec<ObjectVersion> {
    ["Versions", "DeleteMarkers"]
        .into_iter()
        .filter_map(|section| payload.get(section).and_then(serde_json::Value::as_array))
        .flatten()
        .filter_map(|entry| {
            let key = entry.get("Key")?.as_str()?;
            let version_id = entry.get("VersionId")?.as_str()?;
            Some(ObjectVersion {
                key: key.to_owned(),
                version_id: version_id.to_owned(),
            })
        })
        .collect()
}

/// Empties buckets and then deletes them.
#[derive(Clone, Copy, Debug, Default)]
pub struct Buckets {
    pub retry: Retry,
}

impl Buckets {
    async fn empty<P: Invoke>(&self, provider: &P, bucket: &str) {
        let remove_all = Call::new("s3", "rm")
            .positional(format!("s3://{bucket}"))
            .switch("--recursive");
        match provider.invoke(&remove_all).await {
            Ok(_) => log::debug!("  removed current objects of {bucket}"),
            Err(e) => log::warn!("  could not remove objects of {bucket}: {e}"),
        }

        let list = Call::new("s3api", "list-object-versions").value("--bucket", bucket);
        let versions = match provider.invoke(&list).await {
            Ok(payload) => object_versions(&payload),
            Err(e) => {
                log::warn!("  could not list object versions of {bucket}: {e}");
                return;
            }
        };
        if !versions.is_empty() {
            log::info!("  removing {} object version(s) from {bucket}", versions.len());
        }
        for version in versions {
            let call = Call::new("s3api", "delete-object")
                .value("--bucket", bucket)
                .value("--key", &version.key)
                .value("--version-id", &version.version_id);
            if let Err(e) = provider.invoke(&call).await {
                log::warn!(
                    "  could not remove {} ({}) from {bucket}: {e}",
                    version.key,
                    version.version_id
                );
            }
        }
    }
}

impl<P: Invoke + 'static> Delete<P> for Buckets {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Bucket
    }

    async fn delete(&self, request: DeleteRequest<'_, P>) -> DeletionOutcome {
        let mut outcome = DeletionOutcome::default();
        for bucket in request.ids {
            self.empty(request.provider, bucket).await;

            let call = Call::new("s3api", "delete-bucket").value("--bucket", bucket);
            let deleted =
                invoke_with_retry(request.provider, &call, self.retry, request.shutdown).await;
            match deleted {
                Ok(_) => {
                    log::info!("  deleted {bucket}");
                    outcome.record(bucket.clone(), true);
                }
                Err(e) => {
                    log::warn!("  could not delete {bucket}: {e}");
                    outcome.record(bucket.clone(), false);
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        invoke::Arg,
        test::{ids, Scripted},
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn versioned() -> serde_json::Value {
        json!({
            "Versions": [
                {"Key": "a.txt", "VersionId": "v1", "IsLatest": true},
                {"Key": "a.txt", "VersionId": "v0", "IsLatest": false}
            ],
            "DeleteMarkers": [
                {"Key": "b.txt", "VersionId": "m1"}
            ]
        })
    }

    #[test]
    fn versions_include_delete_markers() {
        assert_eq!(
            vec![
                ObjectVersion {
                    key: "a.txt".to_owned(),
                    version_id: "v1".to_owned()
                },
                ObjectVersion {
                    key: "a.txt".to_owned(),
                    version_id: "v0".to_owned()
                },
                ObjectVersion {
                    key: "b.txt".to_owned(),
                    version_id: "m1".to_owned()
                },
            ],
            object_versions(&versioned())
        );
        assert!(object_versions(&serde_json::Value::Null).is_empty());
    }

    #[tokio::test]
    async fn bucket_is_emptied_before_it_is_deleted() {
        let provider = Scripted::new().respond_with(|call| {
            call.is("s3api", "list-object-versions")
                .then(versioned)
        });
        let input = ids(&["my-bucket"]);
        let outcome = Buckets::default()
            .delete(DeleteRequest {
                provider: &provider,
                region: None,
                ids: &input,
                shutdown: &CancellationToken::new(),
            })
            .await;
        assert_eq!(input, outcome.succeeded);
        assert_eq!(
            vec![
                "s3 rm",
                "s3api list-object-versions",
                "s3api delete-object",
                "s3api delete-object",
                "s3api delete-object",
                "s3api delete-bucket",
            ],
            provider.operations()
        );

        let calls = provider.calls();
        assert_eq!(
            vec![
                Arg::Positional("s3://my-bucket".to_owned()),
                Arg::Switch("--recursive")
            ],
            calls[0].args
        );
        assert!(calls.iter().all(|call| call.region.is_none()));
    }

    #[tokio::test]
    async fn version_failures_do_not_prevent_the_bucket_delete() {
        let provider = Scripted::new()
            .respond_with(|call| {
                call.is("s3api", "list-object-versions")
                    .then(versioned)
            })
            .fail_when(|call| {
                call.is("s3", "rm") || call.get_one("--version-id") == Some("v0")
            });
        let input = ids(&["my-bucket"]);
        let outcome = Buckets::default()
            .delete(DeleteRequest {
                provider: &provider,
                region: None,
                ids: &input,
                shutdown: &CancellationToken::new(),
            })
            .await;
        assert_eq!(input, outcome.succeeded);
        assert_eq!(
            Some(&"s3api delete-bucket".to_owned()),
            provider.operations().last()
        );
    }

    #[tokio::test]
    async fn unlistable_bucket_still_gets_a_delete_attempt() {
        let provider = Scripted::new().fail_when(|call| {
            call.is("s3api", "list-object-versions") || call.is("s3api", "delete-bucket")
        });
        let input = ids(&["a", "b"]);
        let outcome = Buckets::default()
            .delete(DeleteRequest {
                provider: &provider,
                region: None,
                ids: &input,
                shutdown: &CancellationToken::new(),
            })
            .await;
        assert_eq!(input, outcome.failed);
        assert_eq!(
            vec![
                "s3 rm",
                "s3api list-object-versions",
                "s3api delete-bucket",
                "s3 rm",
                "s3api list-object-versions",
                "s3api delete-bucket",
            ],
            provider.operations()
        );
    }
}
