//! Local cache of feeds and entries backed by SQLite.
//!
//! Every write runs inside a transaction behind the database's writer lock,
//! so concurrent writers never interleave and a failed or cancelled write
//! leaves the previous state intact.

mod entries;
mod feeds;
mod pending;
mod schema;
mod types;

pub use schema::Database;
pub use types::{
    BatchMerge, DatabaseError, Enclosure, Entry, EntryFlag, Feed, PendingFlag, RemoteEntry,
    RemoteFeed,
};
