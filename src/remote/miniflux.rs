//! Miniflux (API v1) backend.

use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};

use super::error::RemoteError;
use super::http;
use super::{EntryPage, RemoteClient};
use crate::config::BackendKind;
use crate::storage::{Enclosure, EntryFlag, RemoteEntry, RemoteFeed};

pub struct MinifluxClient {
    http: reqwest::Client,
    base: String,
    username: String,
    password: String,
    page_size: u32,
}

#[derive(Debug, Deserialize)]
struct MfFeed {
    id: i64,
    feed_url: String,
    #[serde(default)]
    site_url: Option<String>,
    #[serde(default)]
    title: String,
}

impl From<MfFeed> for RemoteFeed {
    fn from(feed: MfFeed) -> Self {
        RemoteFeed {
            id: feed.id.to_string(),
            title: if feed.title.trim().is_empty() {
                feed.feed_url.clone()
            } else {
                feed.title
            },
            self_link: feed.feed_url,
            alternate_link: feed.site_url.filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MfCategory {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct CreateFeedResponse {
    feed_id: i64,
}

#[derive(Debug, Deserialize)]
struct EntriesResponse {
    #[serde(default)]
    total: i64,
    entries: Vec<MfEntry>,
}

#[derive(Debug, Deserialize)]
struct MfEntry {
    id: i64,
    feed_id: i64,
    status: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    changed_at: Option<String>,
    #[serde(default)]
    starred: bool,
    #[serde(default)]
    enclosures: Option<Vec<MfEnclosure>>,
}

#[derive(Debug, Deserialize)]
struct MfEnclosure {
    url: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    size: Option<i64>,
}

fn parse_timestamp(value: Option<&str>) -> Option<i64> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.timestamp())
}

impl From<MfEntry> for RemoteEntry {
    fn from(entry: MfEntry) -> Self {
        RemoteEntry {
            id: entry.id.to_string(),
            feed_id: entry.feed_id.to_string(),
            title: if entry.title.is_empty() {
                "Untitled".to_string()
            } else {
                entry.title
            },
            link: entry.url.filter(|u| !u.is_empty()),
            author: entry.author.filter(|a| !a.is_empty()),
            published: parse_timestamp(entry.published_at.as_deref()),
            updated: parse_timestamp(entry.changed_at.as_deref()),
            summary: entry.content,
            read: entry.status == "read",
            starred: entry.starred,
            enclosures: entry
                .enclosures
                .unwrap_or_default()
                .into_iter()
                .map(|e| Enclosure {
                    url: e.url,
                    mime_type: e.mime_type.filter(|m| !m.is_empty()),
                    length: e.size.filter(|s| *s > 0),
                })
                .collect(),
        }
    }
}

/// Resume token.
///
/// `changed_after` is the lower bound of the current pass; `high_water`
/// collects the newest change seen. Once the last page has been merged the
/// next pass starts one second before it.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Cursor {
    changed_after: i64,
    offset: u64,
    high_water: i64,
}

impl MinifluxClient {
    pub fn new(
        http: reqwest::Client,
        server_url: &str,
        username: String,
        password: String,
        page_size: u32,
    ) -> Self {
        Self {
            http,
            base: http::join(server_url, "v1"),
            username,
            password,
            page_size: page_size.max(1),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, http::join(&self.base, path))
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let response = http::send(self.request(reqwest::Method::GET, path)).await?;
        http::read_json(response).await
    }
}

fn numeric_id(kind: &str, id: &str) -> Result<i64, RemoteError> {
    id.parse()
        .map_err(|_| RemoteError::NotFound(format!("{kind} {id}")))
}

#[async_trait]
impl RemoteClient for MinifluxClient {
    fn backend(&self) -> BackendKind {
        BackendKind::Miniflux
    }

    async fn list_feeds(&self) -> Result<Vec<RemoteFeed>, RemoteError> {
        let feeds: Vec<MfFeed> = self.get_json("feeds").await?;
        Ok(feeds.into_iter().map(RemoteFeed::from).collect())
    }

    async fn add_feed(&self, url: &str) -> Result<RemoteFeed, RemoteError> {
        // New subscriptions go into the user's first category
        let categories: Vec<MfCategory> = self.get_json("categories").await?;
        let category = categories
            .first()
            .ok_or_else(|| RemoteError::Malformed("server has no categories".to_string()))?;

        let request = self
            .request(reqwest::Method::POST, "feeds")
            .json(&serde_json::json!({ "feed_url": url, "category_id": category.id }));
        let response = http::send(request).await?;
        let created: CreateFeedResponse = http::read_json(response).await?;

        let feed: MfFeed = self.get_json(&format!("feeds/{}", created.feed_id)).await?;
        Ok(feed.into())
    }

    async fn rename_feed(&self, feed_id: &str, title: &str) -> Result<(), RemoteError> {
        let id = numeric_id("feed", feed_id)?;
        let request = self
            .request(reqwest::Method::PUT, &format!("feeds/{id}"))
            .json(&serde_json::json!({ "title": title }));
        http::send(request).await?;
        Ok(())
    }

    async fn delete_feed(&self, feed_id: &str) -> Result<(), RemoteError> {
        let id = numeric_id("feed", feed_id)?;
        http::send(self.request(reqwest::Method::DELETE, &format!("feeds/{id}"))).await?;
        Ok(())
    }

    async fn list_entries(&self, feed_id: &str, cursor: Option<&str>) -> Result<EntryPage, RemoteError> {
        let id = numeric_id("feed", feed_id)?;
        let cursor: Cursor = match cursor {
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                tracing::warn!(feed_id, error = %e, "Discarding unreadable entry cursor");
                Cursor::default()
            }),
            None => Cursor::default(),
        };

        let mut request = self
            .request(reqwest::Method::GET, &format!("feeds/{id}/entries"))
            .query(&[
                ("limit", self.page_size.to_string()),
                ("offset", cursor.offset.to_string()),
                ("order", "id".to_string()),
                ("direction", "asc".to_string()),
            ]);
        if cursor.changed_after > 0 {
            request = request.query(&[("changed_after", cursor.changed_after.to_string())]);
        }
        let response = http::send(request).await?;
        let body: EntriesResponse = http::read_json(response).await?;

        let fetched = body.entries.len() as u64;
        let high_water = body
            .entries
            .iter()
            .filter_map(|e| parse_timestamp(e.changed_at.as_deref()))
            .max()
            .unwrap_or(0)
            .max(cursor.high_water);
        let seen = cursor.offset + fetched;
        let has_more = fetched > 0 && (seen as i64) < body.total;

        let next = if has_more {
            Cursor {
                changed_after: cursor.changed_after,
                offset: seen,
                high_water,
            }
        } else {
            // The server filters with `changed_at > changed_after`; a change
            // landing in the same second as the newest one seen must still match
            Cursor {
                changed_after: (high_water - 1).max(0),
                offset: 0,
                high_water,
            }
        };

        let entries = body
            .entries
            .into_iter()
            .filter(|e| e.status != "removed")
            .map(RemoteEntry::from)
            .collect();

        Ok(EntryPage {
            entries,
            next_cursor: Some(serde_json::to_string(&next)?),
            has_more,
        })
    }

    async fn set_entry_flag(&self, entry_id: &str, flag: EntryFlag, value: bool) -> Result<(), RemoteError> {
        let id = numeric_id("entry", entry_id)?;
        match flag {
            EntryFlag::Read => {
                let status = if value { "read" } else { "unread" };
                let request = self
                    .request(reqwest::Method::PUT, "entries")
                    .json(&serde_json::json!({ "entry_ids": [id], "status": status }));
                http::send(request).await?;
            }
            EntryFlag::Starred => {
                // The bookmark endpoint toggles, so only call it on a mismatch
                let entry: MfEntry = self.get_json(&format!("entries/{id}")).await?;
                if entry.starred != value {
                    http::send(self.request(reqwest::Method::PUT, &format!("entries/{id}/bookmark"))).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, page_size: u32) -> MinifluxClient {
        MinifluxClient::new(
            reqwest::Client::new(),
            &server.uri(),
            "alice".to_string(),
            "secret".to_string(),
            page_size,
        )
    }

    fn entry(id: i64, status: &str, changed_at: &str) -> serde_json::Value {
        json!({
            "id": id,
            "feed_id": 3,
            "status": status,
            "title": format!("Entry {id}"),
            "url": format!("https://example.com/{id}"),
            "author": "",
            "content": "<p>hi</p>",
            "published_at": "2024-01-01T00:00:00Z",
            "changed_at": changed_at,
            "starred": false,
            "enclosures": null
        })
    }

    #[tokio::test]
    async fn test_add_feed_uses_first_category() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/categories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 5, "title": "All"}])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/feeds"))
            .and(body_json(json!({"feed_url": "https://example.com/rss", "category_id": 5})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"feed_id": 3})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/feeds/3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 3,
                "feed_url": "https://example.com/rss",
                "site_url": "https://example.com/",
                "title": "Example"
            })))
            .mount(&server)
            .await;

        let feed = client(&server, 100).add_feed("https://example.com/rss").await.unwrap();
        assert_eq!(
            feed,
            RemoteFeed {
                id: "3".into(),
                title: "Example".into(),
                self_link: "https://example.com/rss".into(),
                alternate_link: Some("https://example.com/".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_entries_paging_and_removed_filter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/feeds/3/entries"))
            .and(query_param("offset", "0"))
            .and(query_param("limit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": 3,
                "entries": [
                    entry(1, "read", "2024-01-02T00:00:00Z"),
                    entry(2, "removed", "2024-01-03T00:00:00Z")
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/feeds/3/entries"))
            .and(query_param("offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": 3,
                "entries": [entry(3, "unread", "2024-01-01T12:00:00Z")]
            })))
            .mount(&server)
            .await;

        let client = client(&server, 2);
        let first = client.list_entries("3", None).await.unwrap();
        assert!(first.has_more);
        assert_eq!(first.entries.len(), 1, "removed entries are skipped");
        assert!(first.entries[0].read);
        assert_eq!(first.entries[0].published, Some(1_704_067_200));

        let second = client
            .list_entries("3", first.next_cursor.as_deref())
            .await
            .unwrap();
        assert!(!second.has_more);
        assert!(!second.entries[0].read);

        let cursor: Cursor = serde_json::from_str(second.next_cursor.as_deref().unwrap()).unwrap();
        assert_eq!(cursor.offset, 0);
        // 2024-01-03T00:00:00Z
        assert_eq!(cursor.high_water, 1_704_240_000);
        assert_eq!(cursor.changed_after, 1_704_239_999);
    }

    #[tokio::test]
    async fn test_incremental_pass_overlaps_newest_second() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/feeds/3/entries"))
            .and(query_param("changed_after", "1704239999"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": 1,
                "entries": [entry(4, "unread", "2024-01-03T00:00:00Z")]
            })))
            .mount(&server)
            .await;

        let client = client(&server, 2);
        let resume = Cursor {
            changed_after: 1_704_239_999,
            offset: 0,
            high_water: 1_704_240_000,
        };
        let page = client
            .list_entries("3", Some(&serde_json::to_string(&resume).unwrap()))
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].id, "4");

        // Nothing newer than the high-water mark: the window does not creep
        let cursor: Cursor = serde_json::from_str(page.next_cursor.as_deref().unwrap()).unwrap();
        assert_eq!(cursor.changed_after, 1_704_239_999);
    }

    #[tokio::test]
    async fn test_star_only_toggles_on_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/entries/9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(entry(9, "unread", "2024-01-01T00:00:00Z")))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/entries/9/bookmark"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, 100);
        client.set_entry_flag("9", EntryFlag::Starred, true).await.unwrap();
        // Already unstarred on the server: no toggle
        client.set_entry_flag("9", EntryFlag::Starred, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_read_sends_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/entries"))
            .and(body_json(json!({"entry_ids": [9], "status": "read"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server, 100)
            .set_entry_flag("9", EntryFlag::Read, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/feeds"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = client(&server, 100).list_feeds().await;
        assert!(matches!(result, Err(RemoteError::Auth)));
    }
}
