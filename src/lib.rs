//! Distributed ray coordination core for a serverless path tracer.
//!
//! A scene is partitioned into disjoint spatial subtrees ("treelets");
//! many short-lived workers each hold a few treelets in memory, and ray
//! states are shuttled between workers over UDP until every path sample
//! resolves. A single coordinator launches the workers, maintains the
//! treelet-to-worker placement, brokers peer discovery, and accumulates
//! finished samples into the output image.

#[macro_use]
extern crate log;

pub mod coordinator;
pub mod core;
pub mod error;
pub mod messages;
pub mod net;
pub mod rays;
pub mod scene;
pub mod storage;
pub mod worker;

// Re-export.
pub use error::{Error, Result};
