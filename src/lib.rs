//! Ad serving backend library
//!
//! Campaign selection, event tracking with invalid-traffic filtering,
//! budget accounting and attribution. The `adserve` binary wires these
//! into an axum server.

pub mod api;
pub mod attribution;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod fraud;
pub mod keystore;
pub mod ledger;
pub mod matching;
pub mod middleware;
pub mod models;
pub mod ranking;
pub mod scheduler;
pub mod store;
pub mod targeting;
pub mod viewability;

#[cfg(test)]
mod test_support;
