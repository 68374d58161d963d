//! Continuous bank-run stress testing for vault contracts.
//!
//! A background producer forks chain state at the current block, replays
//! full-balance withdrawals for each vault's largest holders in descending
//! order against the shared fork, and batches the per-vault liquidity
//! summaries. A periodic report gate, driven once per observed block,
//! coalesces the backlog down to the newest batch and renders it as alerts.

pub mod alert;
pub mod batch_slot;
pub mod config;
pub mod error;
pub mod fork;
pub mod fork_db;
pub mod gate;
pub mod producer;
pub mod ranking;
pub mod registry;
pub mod simulator;
pub mod stats;
