//! Content factory control plane
//!
//! A deterministic reconciler for content jobs. Each tick takes one job
//! contract through load → lock → verify → decide → transition → persist,
//! talking to the outside world only through files and one external Worker
//! process.

pub mod actors;
pub mod config;
pub mod contract;
pub mod event_log;
pub mod fs_util;
pub mod layout;
pub mod lineage;
pub mod lock;
pub mod quality;
pub mod reconciler;
pub mod worker;

pub use config::Config;
pub use reconciler::{Reconciler, TickOptions, TickOutcome, TickReport};
