//! Clients for the remote feed service.
//!
//! Three backends share the [`RemoteClient`] contract: a standalone mode
//! that downloads feeds itself, the Nextcloud News API and the Miniflux API.

mod error;
mod http;
mod miniflux;
mod nextcloud;
mod standalone;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use std::sync::Arc;

pub use error::RemoteError;
pub use miniflux::MinifluxClient;
pub use nextcloud::NextcloudClient;
pub use standalone::{feed_id_for_url, StandaloneClient};

use crate::config::{BackendKind, Config, ConfigError};
use crate::storage::{Database, EntryFlag, RemoteEntry, RemoteFeed};

/// User-Agent for all outgoing requests.
pub const USER_AGENT: &str = concat!("newsync/", env!("CARGO_PKG_VERSION"));

/// One page of entries for a single feed.
#[derive(Debug, Clone, Default)]
pub struct EntryPage {
    pub entries: Vec<RemoteEntry>,
    /// Resume token to persist alongside this page. `None` keeps the
    /// previously stored cursor.
    pub next_cursor: Option<String>,
    /// Whether another page should be requested with `next_cursor`.
    pub has_more: bool,
}

/// Operations the sync engine needs from a remote feed service.
///
/// Implementations never touch the local cache for anything other than
/// reading (standalone mode reads its own feed list back).
#[async_trait]
pub trait RemoteClient: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// The authoritative feed list.
    async fn list_feeds(&self) -> Result<Vec<RemoteFeed>, RemoteError>;

    /// Subscribe to `url`, returning the feed as the server created it.
    async fn add_feed(&self, url: &str) -> Result<RemoteFeed, RemoteError>;

    async fn rename_feed(&self, feed_id: &str, title: &str) -> Result<(), RemoteError>;

    async fn delete_feed(&self, feed_id: &str) -> Result<(), RemoteError>;

    /// Fetch the next page of entries for `feed_id`, resuming from `cursor`.
    async fn list_entries(&self, feed_id: &str, cursor: Option<&str>) -> Result<EntryPage, RemoteError>;

    async fn set_entry_flag(&self, entry_id: &str, flag: EntryFlag, value: bool) -> Result<(), RemoteError>;
}

/// Build the HTTP client shared by every backend.
pub fn build_http_client() -> Result<reqwest::Client, RemoteError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(http::REQUEST_TIMEOUT)
        .connect_timeout(std::time::Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(RemoteError::from)
}

/// Construct the backend selected by `config`.
///
/// # Errors
///
/// Returns `ConfigError::Invalid` when a server backend is selected without
/// a server URL or credentials.
pub fn connect(config: &Config, db: Database) -> Result<Arc<dyn RemoteClient>, ConfigError> {
    let http = build_http_client().map_err(|e| ConfigError::Invalid(e.to_string()))?;

    match config.backend {
        BackendKind::Standalone => Ok(Arc::new(StandaloneClient::new(
            db,
            http,
            config.allow_private_hosts,
        ))),
        BackendKind::Nextcloud | BackendKind::Miniflux => {
            let server_url = config
                .server_url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| ConfigError::Invalid(format!("{} backend requires server_url", config.backend)))?;
            let username = config
                .username
                .clone()
                .ok_or_else(|| ConfigError::Invalid(format!("{} backend requires username", config.backend)))?;
            let password = config
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_string())
                .ok_or_else(|| ConfigError::Invalid(format!("{} backend requires password", config.backend)))?;

            if config.backend == BackendKind::Nextcloud {
                Ok(Arc::new(NextcloudClient::new(
                    http,
                    server_url,
                    username,
                    password,
                    config.entry_page_size,
                )))
            } else {
                Ok(Arc::new(MinifluxClient::new(
                    http,
                    server_url,
                    username,
                    password,
                    config.entry_page_size,
                )))
            }
        }
    }
}
