//! Client-side lifecycle orchestrator for a zk mixer pool.
//!
//! A commitment is created with a fresh secret, watched until its leaf lands
//! in the pool's Merkle tree, then withdrawn to its destination through a
//! relay with a zero-knowledge proof of membership.

pub mod auth;
pub mod chain;
pub mod config;
pub mod constants;
pub mod contract;
pub mod error;
pub mod handlers;
pub mod hasher;
pub mod metrics;
pub mod orchestrator;
pub mod prover;
pub mod relay;
pub mod router;
pub mod state;
pub mod store;
pub mod types;
pub mod utils;
pub mod validation;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;
