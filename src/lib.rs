//! A very simple variant of Bitcask, itself a very simple log-structured
//! key-value engine used e.g. by the Riak database. It is not compatible
//! with Bitcask databases generated by other implementations. See:
//! <https://riak.com/assets/bitcask-intro.pdf>
//!
//! Bitcask writes key-value pairs to an append-only log file, and keeps a
//! mapping of keys to file positions in memory. All live keys must fit in
//! memory. Deletes write a tombstone value to the log file.
//!
//! Unlike a single-file Bitcask, this implementation segments the log into
//! fixed-size-ish files that roll over once full, and shards its in-memory
//! key directory across a configurable number of independently
//! lock-protected partitions so that unrelated keys never contend on the
//! same lock.
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod log;

pub use config::Config;
pub use engine::{Engine, RESERVED_SENTINEL, TOMBSTONE_SENTINEL};
pub use error::{Error, Result};
