//! Remote command execution sessions for Fleet Mate nodes.
//!
//! A caller creates a session for an allow-listed command, the node's driver
//! feeds output and a final exit code into the [`engine::ExecutionEngine`],
//! a live viewer may follow along through a [`channel::Subscriber`], and every
//! finished execution lands in a bounded per-node [`history::HistoryLedger`].

pub mod channel;
pub mod command;
pub mod config;
pub mod engine;
pub mod events;
pub mod history;
pub mod protocol;
pub mod session;
pub mod sse;

pub use engine::{EngineError, ExecutionEngine};
