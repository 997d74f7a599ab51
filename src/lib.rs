//! Typed builders for cluster objects, with poll- and watch-based waiters.

pub mod builder;
pub mod client;
pub mod delete;
pub mod errors;
pub mod memory;
pub mod poll;
pub mod wait;
pub mod watch;

pub use builder::{BuilderOption, ObjectBuilder};
pub use client::{ClusterClient, Object};
pub use errors::{Error, Result};
pub use memory::MemoryClient;
pub use wait::Phased;
