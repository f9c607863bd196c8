//! An embedded, persistent key-value storage engine built on the
//! [Bitcask](https://riak.com/assets/bitcask-intro.pdf) log-structured
//! design: every write is appended to the tail of a datafile, and an
//! in-memory key directory maps each live key straight to its offset.
//!
//! ```no_run
//! use bitfork::Config;
//!
//! let engine = Config::default().open("./data")?;
//! engine.put("hello", "world")?;
//! assert_eq!(engine.get(b"hello")?, b"world");
//! # Ok::<(), bitfork::Error>(())
//! ```

mod config;
mod datafile;
mod engine;
mod error;
mod keydir;
mod lock;
mod merge;
mod record;

pub use config::{
    Config, MergeConfig, MergeThresholds, MergeTriggers, SyncStrategy, DEFAULT_MAX_DATAFILE_SIZE,
    DEFAULT_MAX_KEY_SIZE, DEFAULT_MAX_VALUE_SIZE,
};
pub use engine::Engine;
pub use error::{Error, Result};
pub use merge::merge;
