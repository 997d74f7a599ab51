use crate::errors::status_from_error;
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use kube::api::WatchEvent;

/// Stream of watch events that can be stopped.
#[async_trait]
pub trait EventSource<K>: Send + 'static {
    /// Next event, or `None` once the source is closed.
    async fn next_event(&mut self) -> Option<WatchEvent<K>>;

    /// Releases the underlying subscription. After this call
    /// `next_event` returns `None`.
    fn stop(&mut self);
}

/// Adapts a plain event stream.
pub struct StreamSource<S> {
    stream: Option<S>,
}

impl<S> StreamSource<S> {
    pub fn new(stream: S) -> Self {
        StreamSource {
            stream: Some(stream),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stream.is_none()
    }
}

impl<K> StreamSource<futures::stream::BoxStream<'static, WatchEvent<K>>>
where
    K: Send + 'static,
{
    /// Adapts a raw watch stream. Client errors are turned into Error
    /// events, so a handle reading this source stops on the first one.
    pub fn from_kube<S>(stream: S) -> Self
    where
        S: Stream<Item = kube::Result<WatchEvent<K>>> + Send + 'static,
    {
        let events = stream
            .map(|item| match item {
                Ok(event) => event,
                Err(err) => WatchEvent::Error(status_from_error(&err)),
            })
            .boxed();
        StreamSource::new(events)
    }
}

#[async_trait]
impl<K, S> EventSource<K> for StreamSource<S>
where
    K: Send + 'static,
    S: Stream<Item = WatchEvent<K>> + Send + Unpin + 'static,
{
    async fn next_event(&mut self) -> Option<WatchEvent<K>> {
        match self.stream.as_mut() {
            Some(stream) => stream.next().await,
            None => None,
        }
    }

    fn stop(&mut self) {
        self.stream = None;
    }
}
