//! Stream resolution and offline cache core.
//!
//! Resolves opaque track identifiers into short-lived, authorized media
//! URLs and layers two caches on top of that resolution: an in-memory
//! single-flight cache of resolved streams, and a byte-range persistent
//! cache on disk that fronts all playback reads. Whole-file downloads run
//! through the same path under a bounded-concurrency orchestrator.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod cache;
pub mod cipher;
pub mod config;
pub mod db;
pub mod downloads;
pub mod error;
pub mod http;
pub mod platform;
pub mod protocol;
pub mod resolver;
pub mod source;
pub mod store;
pub mod track;
