//! Waiting for an object to reach some state.
//!
//! Most waiters poll the object with the builder's poll interval. For
//! conditions on individual changes, [`ObjectBuilder::watch_until`] starts a
//! watch-based [`Handle`] instead.

use crate::{
    builder::ObjectBuilder,
    client::{ClusterClient, Object},
    errors::{is_not_found, is_transient, Result, Verb},
    poll::poll_until_timeout,
    watch::{retry_watcher_for, ConditionFn, Handle},
};
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Object with a `status.phase`
pub trait Phased {
    fn phase(&self) -> Option<&str>;
}

impl Phased for Pod {
    fn phase(&self) -> Option<&str> {
        self.status.as_ref()?.phase.as_deref()
    }
}

impl Phased for Namespace {
    fn phase(&self) -> Option<&str> {
        self.status.as_ref()?.phase.as_deref()
    }
}

impl Phased for PersistentVolumeClaim {
    fn phase(&self) -> Option<&str> {
        self.status.as_ref()?.phase.as_deref()
    }
}

impl<K, C> ObjectBuilder<K, C>
where
    K: Object,
    C: ClusterClient,
{
    /// Polls the object until `predicate` holds.
    ///
    /// A missing object and transient errors are retried until the timeout,
    /// since the object may not have been created yet. Other errors end the
    /// wait.
    #[tracing::instrument(skip(self, predicate), fields(kind = %K::kind(&()), name = self.name()))]
    pub async fn wait_until_condition<P>(&self, timeout: Duration, predicate: P) -> Result<()>
    where
        P: Fn(&K) -> bool + Sync,
    {
        self.validate()?;
        let this = self;
        let predicate = &predicate;
        poll_until_timeout(self.poll_interval(), timeout, true, move || async move {
            match this.client().get::<K>(this.namespace(), this.name()).await {
                Ok(object) => Ok(predicate(&object)),
                Err(err) if is_not_found(&err) || is_transient(&err) => {
                    tracing::debug!(error = %err, "failed to fetch object, retrying");
                    Ok(false)
                }
                Err(err) => Err(this.api_error(Verb::Get, err)),
            }
        })
        .await
    }

    /// Waits until the annotation is set, with any value.
    pub async fn wait_until_annotation_exists(&self, key: &str, timeout: Duration) -> Result<()> {
        self.wait_until_condition(timeout, |object| {
            object
                .meta()
                .annotations
                .as_ref()
                .map_or(false, |annotations| annotations.contains_key(key))
        })
        .await
    }

    /// Starts watching the object until `condition` is met.
    ///
    /// The object is fetched first, so the watch begins at its current
    /// resourceVersion and reconnects transparently. A zero timeout means
    /// no timeout. Cancelling `token` stops the returned handle.
    pub async fn watch_until(
        &self,
        token: &CancellationToken,
        timeout: Duration,
        condition: Option<ConditionFn<K>>,
    ) -> Result<Handle> {
        let current = self.get().await?;
        let watcher = retry_watcher_for(self.client().clone(), &current)?;
        tracing::debug!(kind = %K::kind(&()), name = self.name(), version = watcher.resource_version(), "watching object");
        Ok(Handle::with_timeout(token, watcher, timeout, condition))
    }
}

impl<K, C> ObjectBuilder<K, C>
where
    K: Object + Phased,
    C: ClusterClient,
{
    /// Waits until `status.phase` equals `phase`.
    pub async fn wait_until_in_status(&self, phase: &str, timeout: Duration) -> Result<()> {
        self.wait_until_condition(timeout, |object| object.phase() == Some(phase))
            .await
    }
}
