//! # Ana
//!
//! At-most-once execution of caller-defined operations, coordinated through a
//! shared store instead of an in-process lock.
//!
//! ## Core Concepts
//!
//! An [`Operation`] is identified by a `(key, target)` pair plus the caller's
//! `reference_time`. Every execution attempt is tracked durably as a
//! [`TrackedOperation`], and the [`Manager`] turns the stored state into one of
//! three outcomes: **replay** a prior success, **reject** the call, or **run** the
//! work inside a fresh [`Session`].
//!
//! The key principle: **one identity, one execution**. Concurrent callers race on
//! the backend's atomic claim, not on memory shared between them.
//!
//! ## Architecture
//!
//! ```text
//! caller
//!     │
//!     ▼ call(operation)
//! Manager ── expired request? ──────────────────► Err(Expired)
//!     │
//!     ▼ fetch_or_start()          (atomic claim-or-fetch)
//! Repository
//!     │
//!     ├─► None (fresh claim) ─────────────────┐
//!     │                                       │
//!     └─► Some(tracked)                       │
//!             ├─ expired ─────────────────────┼──► Err(Expired)
//!             ├─ finished ────────────────────┼──► Ok(stored result)
//!             ├─ still running ───────────────┼──► Err(StillRunning)
//!             └─ ready / failed / timed out ──┤
//!                                             ▼
//!                              Repository.new_session()   (exclusive lock)
//!                                             │
//!                                   Session.call()  (panic barrier)
//!                                             │
//!                                   Session.close() ─► ctx.success() | ctx.fail()
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Single winner** - of N concurrent first callers exactly one runs the work
//! 2. **Replay** - a finished, unexpired record answers every later call
//! 3. **Expiration wins** - an expired record is never replayed, whatever its status
//! 4. **Timeouts reclaim** - a running record past its timeout may be retried
//! 5. **Panics stay inside** - a panicking work function becomes [`AnaError::Panic`]
//!
//! ## Guarantees
//!
//! - **No scheduling**: the caller decides whether to retry after a rejection
//! - **No cancellation**: timeouts are advisory to other callers and the [`Reaper`]
//! - **Transaction-bounded**: side effects outside the backend's transaction are
//!   not rolled back
//!
//! ## Example
//!
//! ```ignore
//! use ana::{async_trait, Manager, Operation};
//! use ana_postgres::{PgContext, PgRepository};
//! use chrono::{DateTime, Duration, Utc};
//!
//! struct ChargeCard {
//!     key: String,
//!     reference_time: DateTime<Utc>,
//!     charge: Charge,
//! }
//!
//! #[async_trait]
//! impl Operation<PgContext<Charge, Receipt>> for ChargeCard {
//!     type Payload = Charge;
//!     type Output = Receipt;
//!
//!     fn key(&self) -> &str { &self.key }
//!     fn target(&self) -> &str { "POST /charges" }
//!     fn payload(&self) -> &Charge { &self.charge }
//!     fn reference_time(&self) -> DateTime<Utc> { self.reference_time }
//!     fn timeout(&self) -> Duration { Duration::seconds(30) }
//!     fn expiration(&self) -> Duration { Duration::hours(24) }
//!
//!     async fn call(&self, ctx: &mut PgContext<Charge, Receipt>) -> anyhow::Result<Receipt> {
//!         let receipt = insert_charge(ctx.transaction(), &self.charge).await?;
//!         Ok(receipt)
//!     }
//! }
//!
//! let manager = Manager::new(PgRepository::<Charge, Receipt>::new(pool));
//! let receipt = manager.call(&operation).await?;
//! ```

// Core modules
mod error;
mod manager;
mod operation;
mod reaper;
mod repository;
mod session;
mod tracked_operation;

// Re-export core types
pub use crate::operation::Operation;
pub use crate::tracked_operation::{deadline, Claim, OperationStatus, TrackedOperation};

// Re-export error types
pub use crate::error::{AnaError, Result};

// Re-export session types
pub use session::{Finalized, Session, SessionCtx};

// Re-export backend contracts
pub use repository::{ensure_terminal, Maintenance, Repository, EXPIRATION_CAUSE, TIMEOUT_CAUSE};

// Re-export manager (primary entry point)
pub use manager::Manager;

// Re-export maintenance driver
pub use reaper::{Reaper, ReaperConfig, SweepReport, MIN_SWEEP_INTERVAL};

// Re-export commonly used external types
pub use async_trait::async_trait;
