//! Per-kind deletion operations and their registry.
use std::{collections::BTreeMap, future::Future, pin::Pin};

use tokio_util::sync::CancellationToken;

use crate::{kind::ResourceKind, outcome::DeletionOutcome};

/// A batch of ids of one kind, in one region, to delete.
pub struct DeleteRequest<'a, P> {
    /// The platform provider, eg [`AwsCli`](crate::invoke::AwsCli).
    pub provider: &'a P,
    /// `None` for global kinds.
    pub region: Option<&'a str>,
    /// Duplicate free.
    pub ids: &'a [String],
    /// Cancelled when the run is shutting down. Operations stop retrying,
    /// but still account for every id.
    pub shutdown: &'a CancellationToken,
}

impl<P> Clone for DeleteRequest<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for DeleteRequest<'_, P> {}

/// Deletes resources of a single kind.
///
/// Implementations must not give up on a batch because one id failed, and
/// must account for every id in the request, either as succeeded or failed.
pub trait Delete<P>: 'static {
    fn kind(&self) -> ResourceKind;

    fn delete(&self, request: DeleteRequest<'_, P>) -> impl Future<Output = DeletionOutcome>;
}

/// Object safe form of [`Delete`], so that operations of different types
/// can share one registry.
trait ErasedDelete<P> {
    fn name(&self) -> &'static str;

    fn delete_boxed<'a>(
        &'a self,
        request: DeleteRequest<'a, P>,
    ) -> Pin<Box<dyn Future<Output = DeletionOutcome> + 'a>>;
}

impl<P: 'static, D: Delete<P>> ErasedDelete<P> for D {
    fn name(&self) -> &'static str {
        std::any::type_name::<D>()
    }

    fn delete_boxed<'a>(
        &'a self,
        request: DeleteRequest<'a, P>,
    ) -> Pin<Box<dyn Future<Output = DeletionOutcome> + 'a>> {
        Box::pin(self.delete(request))
    }
}

/// Maps each [`ResourceKind`] to the operation that deletes it.
pub struct Registry<P> {
    deleters: BTreeMap<ResourceKind, Box<dyn ErasedDelete<P>>>,
}

impl<P> Default for Registry<P> {
    fn default() -> Self {
        Self {
            deleters: Default::default(),
        }
    }
}

impl<P: 'static> Registry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the operation for `deleter.kind()`, replacing any previous one.
    pub fn register<D: Delete<P>>(&mut self, deleter: D) -> &mut Self {
        let kind = deleter.kind();
        if let Some(previous) = self.deleters.get(&kind) {
            log::debug!(
                "replacing {} with {} for {kind}",
                previous.name(),
                std::any::type_name::<D>()
            );
        }
        self.deleters.insert(kind, Box::new(deleter));
        self
    }

    pub fn with<D: Delete<P>>(mut self, deleter: D) -> Self {
        self.register(deleter);
        self
    }

    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.deleters.contains_key(&kind)
    }

    /// Run the operation registered for `kind`.
    ///
    /// Returns `None` if nothing is registered.
    pub async fn delete(
        &self,
        kind: ResourceKind,
        request: DeleteRequest<'_, P>,
    ) -> Option<DeletionOutcome> {
        let deleter = self.deleters.get(&kind)?;
        log::trace!("deleting {kind} with {}", deleter.name());
        Some(deleter.delete_boxed(request).await)
    }
}
