#![deny(clippy::all)]

//! Blockmeld sits next to a managed blockchain node, reads blocks out of its
//! console stream, and archives them to object storage as one-block files
//! and fixed-size merged bundles. See [`plugin::MindReaderPlugin`] for the
//! orchestration entry point and [`archiver::Archiver`] for the per-block
//! decision engine.

pub mod archiver;
pub mod block;
pub mod bundler;
pub mod config;
pub mod encoding;
pub mod internal_events;
pub mod monitor;
pub mod oneblock;
pub mod plugin;
pub mod reader;
pub mod shutdown;
pub mod store;
pub mod stream;
pub mod uploader;

pub use self::archiver::{ArchiveError, Archiver, ArchiverIo};
pub use self::block::Block;
pub use self::bundler::Bundler;
pub use self::config::Config;
pub use self::oneblock::OneBlockFile;
pub use self::plugin::{MindReaderPlugin, PluginOptions};
pub use self::shutdown::ShutdownSignal;
