//! # relsync
//!
//! The service side of relsync: configuration, event sources, the live
//! feed, the async queue consumer and sweep driver, the daemon and its
//! operations endpoint, and the CLI on top.
//!
//! The reconciliation logic itself lives in `relsync-core`; this crate only
//! schedules it and connects it to the network.

pub mod api;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod feed;
pub mod pipeline;
pub mod source;
