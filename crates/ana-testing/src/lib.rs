//! Testing utilities for ana.
//!
//! - [`InMemoryRepository`]: a complete backend with the same claim and locking
//!   rules as the PostgreSQL one, for concurrency tests and demos
//! - [`MockOperation`]: an operation that succeeds, fails, or panics on demand and
//!   counts its executions
//! - [`StaticRepository`] + [`RecordingContext`]: serve one fixed record and count
//!   finalizations, for exercising the manager's decisions in isolation

mod memory;
mod operation;
mod recording;

pub use memory::{InMemoryRepository, MemoryContext};
pub use operation::{Behavior, MockOperation};
pub use recording::{RecordingContext, StaticRepository};
