//! Connection management for the live market-data feed
//!
//! - `machine`: sans-IO lifecycle state machine
//! - `manager`: async handle and driver task
//! - `probe`: pre-connect health check
//! - `synthetic`: fallback latency and quote generator
//! - `timers`: one-slot-per-kind timer bookkeeping

pub mod machine;
pub mod manager;
pub mod probe;
pub mod state;
pub mod synthetic;
pub mod timers;

pub use machine::{Command, FeedMachine, Input, Policy, ProbeId, TransportId};
pub use manager::FeedManager;
pub use probe::{HealthProbe, HttpHealthProbe, StaticProbe};
pub use state::{ConnectionState, FailureKind, FeedEvent, FeedStatus, ProbeOutcome};
pub use synthetic::SyntheticFeed;
pub use timers::{TimerKind, TimerOp, TimerToken};
