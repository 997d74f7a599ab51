use crate::{
    client::{ClusterClient, EventStream, Object},
    errors::{is_transient, status_from_error, Error},
    watch::EventSource,
};
use async_trait::async_trait;
use futures::stream::StreamExt;
use kube::api::{ResourceExt, WatchEvent, WatchParams};
use rand::distributions::Distribution;
use std::{marker::PhantomData, time::Duration};

const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

async fn backoff(delay: Duration) {
    let dist = rand::distributions::Uniform::new(1.0, 1.1);
    let factor = dist.sample(&mut rand::thread_rng());
    tokio::time::sleep(delay.mul_f64(factor)).await;
}

/// Watches a single object and transparently reopens the watch when the
/// server closes it, resuming from the last resourceVersion seen.
///
/// Error events with code 500 or 504 also cause a reconnect. Any other
/// Error event (410 Gone included) is passed on and closes the watcher.
pub struct RetryWatcher<K, C> {
    client: C,
    namespace: Option<String>,
    name: String,
    resource_version: String,
    stream: Option<EventStream<K>>,
    stopped: bool,
    // whether the current stream produced an event
    received: bool,
    restart_delay: Duration,
    _kind: PhantomData<fn() -> K>,
}

impl<K, C> std::fmt::Debug for RetryWatcher<K, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryWatcher")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("resource_version", &self.resource_version)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

/// Creates a watcher following `object`, starting right after the
/// resourceVersion the object carries.
pub fn retry_watcher_for<K, C>(client: C, object: &K) -> Result<RetryWatcher<K, C>, Error>
where
    K: Object,
    C: ClusterClient,
{
    let name = object
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::WatchSetup("object has no name".to_string()))?;
    let namespace = match K::NAMESPACED {
        true => object.namespace(),
        false => None,
    };
    RetryWatcher::new(client, namespace, name, object.resource_version().unwrap_or_default())
}

impl<K, C> RetryWatcher<K, C>
where
    K: Object,
    C: ClusterClient,
{
    /// Fails if `resource_version` is empty or "0": those ask the server
    /// for a synthetic initial state, which cannot be resumed reliably.
    pub fn new(
        client: C,
        namespace: Option<String>,
        name: String,
        resource_version: String,
    ) -> Result<Self, Error> {
        if resource_version.is_empty() || resource_version == "0" {
            return Err(Error::WatchSetup(format!(
                "initial resourceVersion {:?} is not supported",
                resource_version
            )));
        }
        Ok(RetryWatcher {
            client,
            namespace,
            name,
            resource_version,
            stream: None,
            stopped: false,
            received: false,
            restart_delay: DEFAULT_RESTART_DELAY,
            _kind: PhantomData,
        })
    }

    /// Base delay before reconnecting after a failure.
    /// Actually it is multiplied by a random number in [1.0, 1.1).
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Last resourceVersion observed
    pub fn resource_version(&self) -> &str {
        &self.resource_version
    }

    fn params(&self) -> WatchParams {
        WatchParams::default().fields(&format!("metadata.name={}", self.name))
    }

    fn track(&mut self, event: &WatchEvent<K>) {
        let version = match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                obj.resource_version()
            }
            WatchEvent::Bookmark(bookmark) => Some(bookmark.metadata.resource_version.clone()),
            WatchEvent::Error(_) => None,
        };
        match version {
            Some(version) if !version.is_empty() => self.resource_version = version,
            _ => tracing::warn!(name = %self.name, "watch event without resourceVersion"),
        }
    }

    #[tracing::instrument(skip(self), fields(name = %self.name, version = %self.resource_version))]
    async fn connect(&mut self) -> Option<WatchEvent<K>> {
        loop {
            let params = self.params();
            let opened = self
                .client
                .watch::<K>(self.namespace.as_deref(), &params, &self.resource_version)
                .await;
            match opened {
                Ok(stream) => {
                    self.stream = Some(stream);
                    return None;
                }
                Err(err) if is_transient(&err) => {
                    tracing::warn!(error = %err, "failed to open watch, retrying");
                    backoff(self.restart_delay).await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to open watch");
                    return Some(WatchEvent::Error(status_from_error(&err)));
                }
            }
        }
    }
}

#[async_trait]
impl<K, C> EventSource<K> for RetryWatcher<K, C>
where
    K: Object,
    C: ClusterClient,
{
    async fn next_event(&mut self) -> Option<WatchEvent<K>> {
        loop {
            if self.stopped {
                return None;
            }
            if self.stream.is_none() {
                if let Some(fatal) = self.connect().await {
                    self.stop();
                    return Some(fatal);
                }
                self.received = false;
            }
            let Some(stream) = self.stream.as_mut() else {
                continue;
            };

            match stream.next().await {
                Some(Ok(WatchEvent::Error(status))) if status.code == 500 || status.code == 504 => {
                    tracing::debug!(code = status.code, message = %status.message, "watch error event, reconnecting");
                    self.stream = None;
                    backoff(self.restart_delay).await;
                }
                Some(Ok(WatchEvent::Error(status))) => {
                    tracing::debug!(code = status.code, message = %status.message, "watch error event, closing");
                    self.stop();
                    return Some(WatchEvent::Error(status));
                }
                Some(Ok(event)) => {
                    self.received = true;
                    self.track(&event);
                    return Some(event);
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, name = %self.name, "watch stream failed, reconnecting");
                    self.stream = None;
                    backoff(self.restart_delay).await;
                }
                None => {
                    tracing::debug!(name = %self.name, version = %self.resource_version, "watch closed, resuming");
                    self.stream = None;
                    // a watch closing before producing anything is not reopened right away
                    if !self.received {
                        backoff(self.restart_delay).await;
                    }
                }
            }
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.stream = None;
    }
}
