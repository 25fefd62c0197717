//! Content-addressed, log-structured on-disk object cache engine.
//!
//! A single logical [`Store`](store::Store) of [`Span`](span::Span)s is carved into
//! [`Disk`](disk::Disk)s and, within each disk, [`Volume`](volume::Volume)s -- circular log regions
//! each with their own in-memory [`Directory`](directory::Directory). Callers drive reads and
//! writes through the [`Engine`](engine::Engine), which routes by key to a volume and runs a
//! [`ReadVC`](vc::ReadVC) or [`WriteVC`](vc::WriteVC) to completion.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::type_complexity)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

pub mod config;
pub mod directory;
pub mod disk;
pub mod doc;
pub mod engine;
pub mod error;
pub mod io;
pub mod key;
pub mod ram_cache;
pub mod recovery;
pub mod span;
pub mod store;
pub mod vc;
pub mod volume;

#[cfg(test)]
mod integration_tests;

pub use engine::Engine;
pub use error::{CacheError, KeyedCacheError};
pub use key::{CacheFragType, CacheKey};
