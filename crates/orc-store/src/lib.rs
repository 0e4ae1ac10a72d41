//! File-backed JSON document store for the orchestrator kernel.
//!
//! Two document families live under a configurable data root: a single
//! `projects.json` registry and one `projects/<id>/tasks.json` per
//! project. Every mutation is a read-lock-modify-write-unlock cycle
//! against a `.lock` sibling file guarded by a cross-process advisory
//! lock (see [`lockfile`]); there is no in-memory cache kept between
//! calls, mirroring the source tooling's own `filelock.FileLock` +
//! whole-file-rewrite discipline.

pub mod config;
pub mod document;
pub mod error;
pub mod lockfile;
pub mod models;

pub use config::StoreConfig;
pub use document::Store;
pub use error::{Result, StoreError};
