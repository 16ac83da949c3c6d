//! newsync: keeps a local SQLite cache of feeds and entries in step with a
//! standalone, Nextcloud News or Miniflux backend.

pub mod config;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod util;
