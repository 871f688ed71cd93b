//! # minnesvakt-core
//!
//! Allocation bookkeeping and block-granular pooling.
//! Built with safety, observability, and deterministic failure semantics
//! as primary design constraints.
//!
//! ### Expectations (Production):
//! - Every tracked allocation accounted for until released
//! - Misuse detected and reported, never silently corrupting state
//! - One automatic recovery attempt on exhaustion, then clean failure
//!
//! ### Key Submodules:
//! - `ledger`: process-wide registry of live allocations with leak reports
//! - `pool`: fixed-block arena with LIFO block reuse
//! - `trackable`: opt-in capability routing storage through ledger and pool

pub mod error;
pub mod ledger;
pub mod pool;
pub mod trackable;

pub mod prelude {
    pub use crate::error::*;
    pub use crate::ledger::*;
    pub use crate::pool::*;
    pub use crate::trackable::*;
}

pub use error::MemoryError;
