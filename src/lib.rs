//! Off-chain keeper for the Bitredict prediction contracts.
//!
//! Shared by the long-running `bitredict-keeper` daemon and the `keeper-ops`
//! operator CLI.

pub mod cache;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod indexer;
pub mod oddyssey;
pub mod outcome;
pub mod results;
pub mod scheduler;
pub mod services;
pub mod settlement;
pub mod store;
