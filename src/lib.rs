//! Scrobble reconciliation library: Last.fm history, the candidate store and
//! the tiered matcher shared by the `scrobble-match` binary.

pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod lastfm;
pub mod logging;
pub mod models;
pub mod normalize;
pub mod progress;
pub mod safety;
pub mod scoring;
pub mod store;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{Error, Result};
