//! # wampd-core
//!
//! RPC dealer for wampd.
//!
//! This crate provides:
//! - The procedure registration table with match and invocation policies
//! - Registration meta-procedures answered locally
//! - Call and invocation state tracking with cancellation and timeouts
//! - The dealer that routes RPC messages between sessions
//! - Per-procedure call statistics

pub mod call;
pub mod dealer;
pub mod error;
pub mod meta;
pub mod peer;
pub mod stats;
pub mod table;

pub use call::{Call, CallState, Invocation, TargetState};
pub use dealer::{Dealer, DealerOptions};
pub use error::CoreError;
pub use meta::MetaProcedure;
pub use peer::{MetaEventSink, NullSink, Peer, RegistrationEvent, RegistrationEventKind};
pub use stats::{CallStats, DealerStats, StatsSnapshot};
pub use table::{Procedure, RegistrationEntry, RegistrationTable, Target};
