//! Standalone mode: no server, feeds are downloaded and parsed directly.
//!
//! The local cache is the source of truth for the feed list and for entry
//! flags, so feed reconciliation is always a no-op and flag mutations are
//! acknowledged immediately.

use async_trait::async_trait;
use feed_rs::parser;
use sha2::{Digest, Sha256};

use super::error::RemoteError;
use super::http;
use super::{EntryPage, RemoteClient};
use crate::config::BackendKind;
use crate::storage::{Database, Enclosure, EntryFlag, RemoteEntry, RemoteFeed};
use crate::util::{strip_control_chars, validate_feed_url};

/// Backend that fetches RSS/Atom/JSON feeds itself.
pub struct StandaloneClient {
    db: Database,
    http: reqwest::Client,
    allow_private_hosts: bool,
}

impl StandaloneClient {
    pub fn new(db: Database, http: reqwest::Client, allow_private_hosts: bool) -> Self {
        Self {
            db,
            http,
            allow_private_hosts,
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        let response = http::send(self.http.get(url)).await?;
        http::read_limited_bytes(response, http::MAX_BODY_SIZE).await
    }
}

#[async_trait]
impl RemoteClient for StandaloneClient {
    fn backend(&self) -> BackendKind {
        BackendKind::Standalone
    }

    async fn list_feeds(&self) -> Result<Vec<RemoteFeed>, RemoteError> {
        let feeds = self
            .db
            .get_feeds()
            .await
            .map_err(|e| RemoteError::Local(e.to_string()))?;

        Ok(feeds
            .into_iter()
            .map(|f| RemoteFeed {
                id: f.id,
                title: f.title,
                self_link: f.self_link,
                alternate_link: f.alternate_link,
            })
            .collect())
    }

    async fn add_feed(&self, url: &str) -> Result<RemoteFeed, RemoteError> {
        validate_feed_url(url, self.allow_private_hosts)?;
        let bytes = self.download(url).await?;
        parse_feed_meta(url, &bytes)
    }

    async fn rename_feed(&self, _feed_id: &str, _title: &str) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn delete_feed(&self, _feed_id: &str) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn list_entries(&self, feed_id: &str, _cursor: Option<&str>) -> Result<EntryPage, RemoteError> {
        let feed = self
            .db
            .get_feed(feed_id)
            .await
            .map_err(|e| RemoteError::Local(e.to_string()))?
            .ok_or_else(|| RemoteError::NotFound(format!("feed {feed_id}")))?;

        // A 404 from the website is a fetch failure, not a missing subscription
        let bytes = self.download(&feed.self_link).await.map_err(|e| match e {
            RemoteError::NotFound(_) => RemoteError::HttpStatus(404),
            other => other,
        })?;
        let mut entries = parse_feed_entries(feed_id, &bytes)?;

        // Flags live only in the cache; echo the committed values back so the
        // merge does not reset them.
        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        let committed = self
            .db
            .get_committed_flags(&ids)
            .await
            .map_err(|e| RemoteError::Local(e.to_string()))?;
        for entry in &mut entries {
            if let Some(&(read, starred)) = committed.get(&entry.id) {
                entry.read = read;
                entry.starred = starred;
            }
        }

        Ok(EntryPage {
            entries,
            next_cursor: None,
            has_more: false,
        })
    }

    async fn set_entry_flag(&self, _entry_id: &str, _flag: EntryFlag, _value: bool) -> Result<(), RemoteError> {
        Ok(())
    }
}

/// Stable feed id for standalone mode
pub fn feed_id_for_url(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.trim().as_bytes()))
}

fn entry_id_for(feed_id: &str, guid: &str) -> String {
    format!("{:x}", Sha256::digest(format!("{feed_id}|{guid}").as_bytes()))
}

fn parse_feed_meta(url: &str, bytes: &[u8]) -> Result<RemoteFeed, RemoteError> {
    let feed = parser::parse(bytes).map_err(|e| RemoteError::Malformed(e.to_string()))?;

    let title = feed
        .title
        .map(|t| strip_control_chars(t.content.trim()).into_owned())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| url.to_string());
    let alternate_link = feed
        .links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self"))
        .map(|l| l.href.clone());

    Ok(RemoteFeed {
        id: feed_id_for_url(url),
        title,
        self_link: url.to_string(),
        alternate_link,
    })
}

fn parse_feed_entries(feed_id: &str, bytes: &[u8]) -> Result<Vec<RemoteEntry>, RemoteError> {
    let feed = parser::parse(bytes).map_err(|e| RemoteError::Malformed(e.to_string()))?;

    Ok(feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone());
            let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());
            let updated = entry.updated.map(|dt| dt.timestamp());
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body));
            let title = entry
                .title
                .map(|t| strip_control_chars(&t.content).into_owned())
                .unwrap_or_else(|| "Untitled".to_string());
            let author = entry.authors.first().map(|p| p.name.clone());
            let enclosures = entry
                .media
                .iter()
                .flat_map(|m| m.content.iter())
                .filter_map(|c| {
                    c.url.as_ref().map(|url| Enclosure {
                        url: url.to_string(),
                        mime_type: c.content_type.as_ref().map(|m| m.to_string()),
                        length: c.size.and_then(|s| i64::try_from(s).ok()),
                    })
                })
                .collect();

            let guid = if entry.id.trim().is_empty() {
                generate_guid(link.as_deref(), &title, published)
            } else {
                entry.id.trim().to_string()
            };

            RemoteEntry {
                id: entry_id_for(feed_id, &guid),
                feed_id: feed_id.to_string(),
                title,
                link,
                author,
                published,
                updated,
                summary,
                read: false,
                starred: false,
                enclosures,
            }
        })
        .collect())
}

fn generate_guid(url: Option<&str>, title: &str, published: Option<i64>) -> String {
    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    format!("{:x}", Sha256::digest(input.as_bytes()))
}
