use crate::watch::EventSource;
use event_listener::Event;
use kube::{api::WatchEvent, core::ErrorResponse};
use std::{
    marker::PhantomData,
    sync::{Arc, OnceLock},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Called on every added, modified or deleted event. An error stops the
/// handle; otherwise watching goes on until it returns `true`. The token is
/// the same on every call and is cancelled once the handle finishes.
pub type ConditionFn<K> =
    Box<dyn FnMut(&CancellationToken, &WatchEvent<K>) -> anyhow::Result<bool> + Send>;

/// Boxes a closure into a condition.
pub fn condition<K, F>(func: F) -> Option<ConditionFn<K>>
where
    F: FnMut(&CancellationToken, &WatchEvent<K>) -> anyhow::Result<bool> + Send + 'static,
{
    Some(Box::new(func))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("context canceled")]
    Canceled,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HandleError {
    #[error("condition function is nil")]
    NilCondition,
    #[error("watcher results closed unexpectedly")]
    ResultsClosed,
    #[error("watcher sent an error event: {0}")]
    ErrorEvent(#[source] ErrorResponse),
    #[error("condition function returned non-nil error: {0:#}")]
    Condition(Arc<anyhow::Error>),
    #[error("handle context done: {0}")]
    ContextDone(#[source] ContextError),
    #[error("watch task ended without reporting a result")]
    Aborted,
}

impl HandleError {
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, HandleError::ContextDone(ContextError::DeadlineExceeded))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, HandleError::ContextDone(ContextError::Canceled))
    }
}

struct Shared {
    result: OnceLock<Result<(), HandleError>>,
    done: Event,
}

impl Shared {
    fn complete(&self, result: Result<(), HandleError>) {
        if self.result.set(result).is_err() {
            tracing::warn!("watch handle completed twice, keeping the first result");
        }
        self.done.notify(usize::MAX);
    }
}

/// Results of an asynchronous watch condition.
///
/// The watch task starts eagerly and runs once; its result is kept in the
/// handle. Clones share the same task and result.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Starts watching with no timeout. Must be called within a tokio runtime.
    pub fn new<K, S>(
        parent: &CancellationToken,
        source: S,
        condition: Option<ConditionFn<K>>,
    ) -> Handle
    where
        K: Send + 'static,
        S: EventSource<K>,
    {
        Handle::with_timeout(parent, source, Duration::ZERO, condition)
    }

    /// Works like [`Handle::new`], but the task also finishes once `timeout`
    /// has passed. A zero timeout means no timeout.
    pub fn with_timeout<K, S>(
        parent: &CancellationToken,
        source: S,
        timeout: Duration,
        condition: Option<ConditionFn<K>>,
    ) -> Handle
    where
        K: Send + 'static,
        S: EventSource<K>,
    {
        let shared = Arc::new(Shared {
            result: OnceLock::new(),
            done: Event::new(),
        });
        let guard = Completion {
            source,
            shared: shared.clone(),
            result: None,
            _kind: PhantomData,
        };
        let timeout = Some(timeout).filter(|t| !t.is_zero());
        let token = parent.child_token();
        tokio::task::spawn(run(guard, token, timeout, condition).in_current_span());
        Handle { shared }
    }

    /// Waits until the watch task has finished. Returns the same result
    /// every time it is called.
    pub async fn wait(&self) -> Result<(), HandleError> {
        loop {
            if let Some(result) = self.shared.result.get() {
                return result.clone();
            }
            let listener = self.shared.done.listen();
            // the task may have finished before we started listening
            if let Some(result) = self.shared.result.get() {
                return result.clone();
            }
            listener.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.shared.result.get().is_some()
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("result", &self.shared.result.get())
            .finish()
    }
}

/// Owns the source for the lifetime of the task. Stops it and publishes
/// the result when dropped, whichever way the task ends.
struct Completion<K, S: EventSource<K>> {
    source: S,
    shared: Arc<Shared>,
    result: Option<Result<(), HandleError>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K, S: EventSource<K>> Drop for Completion<K, S> {
    fn drop(&mut self) {
        self.source.stop();
        let result = self.result.take().unwrap_or(Err(HandleError::Aborted));
        self.shared.complete(result);
    }
}

async fn run<K, S>(
    mut guard: Completion<K, S>,
    token: CancellationToken,
    timeout: Option<Duration>,
    condition: Option<ConditionFn<K>>,
) where
    K: Send + 'static,
    S: EventSource<K>,
{
    let _cancel_on_exit = token.clone().drop_guard();
    let result = watch_loop(&mut guard.source, &token, timeout, condition).await;
    match &result {
        Ok(()) => tracing::debug!("watch condition met"),
        Err(err) => tracing::debug!(error = %err, "watch handle finished with error"),
    }
    guard.result = Some(result);
}

async fn watch_loop<K, S>(
    source: &mut S,
    token: &CancellationToken,
    timeout: Option<Duration>,
    condition: Option<ConditionFn<K>>,
) -> Result<(), HandleError>
where
    S: EventSource<K>,
{
    let mut cond = condition.ok_or(HandleError::NilCondition)?;
    let deadline = async move {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => futures::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        let event = tokio::select! {
            event = source.next_event() => event,
            _ = token.cancelled() => {
                return Err(HandleError::ContextDone(ContextError::Canceled));
            }
            _ = &mut deadline => {
                return Err(HandleError::ContextDone(ContextError::DeadlineExceeded));
            }
        };
        let event = event.ok_or(HandleError::ResultsClosed)?;

        match &event {
            WatchEvent::Error(status) => return Err(HandleError::ErrorEvent(status.clone())),
            // bookmarks are not guaranteed to arrive and carry no object change
            WatchEvent::Bookmark(_) => continue,
            _ => (),
        }

        let met = cond(token, &event).map_err(|err| HandleError::Condition(Arc::new(err)))?;
        if met {
            return Ok(());
        }
    }
}
