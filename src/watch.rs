//! Watching a single object until a condition holds.
//!
//! A [`Handle`] drives any [`EventSource`] on a background task. A
//! [`RetryWatcher`] is the usual source: it follows one object and resumes
//! after disconnects from the last resourceVersion it saw.

mod handle;
mod retry;
mod source;

pub use handle::{condition, ConditionFn, ContextError, Handle, HandleError};
pub use retry::{retry_watcher_for, RetryWatcher};
pub use source::{EventSource, StreamSource};
