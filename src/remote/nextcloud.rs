//! Nextcloud News (API v1-3) backend.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use super::error::RemoteError;
use super::http;
use super::{EntryPage, RemoteClient};
use crate::config::BackendKind;
use crate::storage::{Enclosure, EntryFlag, RemoteEntry, RemoteFeed};

const API_PATH: &str = "index.php/apps/news/api/v1-3";

/// Item type filter meaning "a single feed" in the items endpoints.
const TYPE_FEED: u8 = 0;

pub struct NextcloudClient {
    http: reqwest::Client,
    base: String,
    username: String,
    password: String,
    batch_size: u32,
}

#[derive(Debug, Deserialize)]
struct FeedsResponse {
    feeds: Vec<NcFeed>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NcFeed {
    id: i64,
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    link: Option<String>,
}

impl From<NcFeed> for RemoteFeed {
    fn from(feed: NcFeed) -> Self {
        RemoteFeed {
            id: feed.id.to_string(),
            title: feed
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| feed.url.clone()),
            self_link: feed.url,
            alternate_link: feed.link.filter(|l| !l.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ItemsResponse {
    items: Vec<NcItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NcItem {
    id: i64,
    feed_id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    pub_date: Option<i64>,
    #[serde(default)]
    updated_date: Option<i64>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    enclosure_mime: Option<String>,
    #[serde(default)]
    enclosure_link: Option<String>,
    unread: bool,
    starred: bool,
    #[serde(deserialize_with = "int_or_string")]
    last_modified: i64,
}

impl From<NcItem> for RemoteEntry {
    fn from(item: NcItem) -> Self {
        let enclosures = item
            .enclosure_link
            .filter(|l| !l.is_empty())
            .map(|url| {
                vec![Enclosure {
                    url,
                    mime_type: item.enclosure_mime.filter(|m| !m.is_empty()),
                    length: None,
                }]
            })
            .unwrap_or_default();

        RemoteEntry {
            id: item.id.to_string(),
            feed_id: item.feed_id.to_string(),
            title: item.title.unwrap_or_else(|| "Untitled".to_string()),
            link: item.url.filter(|u| !u.is_empty()),
            author: item.author.filter(|a| !a.is_empty()),
            published: item.pub_date,
            updated: item.updated_date,
            summary: item.body,
            read: !item.unread,
            starred: item.starred,
            enclosures,
        }
    }
}

/// Newer servers send `lastModified` as a string of microseconds, older
/// ones as a number.
fn int_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Ok(v),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Resume token. While `offset` is set the backlog is still being paged
/// oldest-first; afterwards only items modified since `last_modified` are
/// requested.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
struct Cursor {
    offset: Option<i64>,
    last_modified: i64,
}

impl NextcloudClient {
    pub fn new(
        http: reqwest::Client,
        server_url: &str,
        username: String,
        password: String,
        batch_size: u32,
    ) -> Self {
        Self {
            http,
            base: http::join(server_url, API_PATH),
            username,
            password,
            batch_size: batch_size.max(1),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, http::join(&self.base, path))
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn fetch_items(&self, request: reqwest::RequestBuilder) -> Result<Vec<NcItem>, RemoteError> {
        let response = http::send(request).await?;
        let body: ItemsResponse = http::read_json(response).await?;
        Ok(body.items)
    }
}

fn numeric_id(kind: &str, id: &str) -> Result<i64, RemoteError> {
    id.parse()
        .map_err(|_| RemoteError::NotFound(format!("{kind} {id}")))
}

#[async_trait]
impl RemoteClient for NextcloudClient {
    fn backend(&self) -> BackendKind {
        BackendKind::Nextcloud
    }

    async fn list_feeds(&self) -> Result<Vec<RemoteFeed>, RemoteError> {
        let response = http::send(self.request(reqwest::Method::GET, "feeds")).await?;
        let body: FeedsResponse = http::read_json(response).await?;
        Ok(body.feeds.into_iter().map(RemoteFeed::from).collect())
    }

    async fn add_feed(&self, url: &str) -> Result<RemoteFeed, RemoteError> {
        let request = self
            .request(reqwest::Method::POST, "feeds")
            .json(&serde_json::json!({ "url": url, "folderId": 0 }));
        let response = http::send(request).await?;
        let body: FeedsResponse = http::read_json(response).await?;
        body.feeds
            .into_iter()
            .next()
            .map(RemoteFeed::from)
            .ok_or_else(|| RemoteError::Malformed("server created no feed".to_string()))
    }

    async fn rename_feed(&self, feed_id: &str, title: &str) -> Result<(), RemoteError> {
        let id = numeric_id("feed", feed_id)?;
        let request = self
            .request(reqwest::Method::PUT, &format!("feeds/{id}/rename"))
            .json(&serde_json::json!({ "feedTitle": title }));
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
            None => Cursor {
                offset: Some(0),
                last_modified: 0,
            },
        };

        let (items, backlog) = match cursor.offset {
            Some(offset) => {
                let request = self.request(reqwest::Method::GET, "items").query(&[
                    ("batchSize", self.batch_size.to_string()),
                    ("offset", offset.to_string()),
                    ("type", TYPE_FEED.to_string()),
                    ("id", id.to_string()),
                    ("getRead", "true".to_string()),
                    ("oldestFirst", "true".to_string()),
                ]);
                (self.fetch_items(request).await?, true)
            }
            None => {
                let request = self.request(reqwest::Method::GET, "items/updated").query(&[
                    ("lastModified", cursor.last_modified.to_string()),
                    ("type", TYPE_FEED.to_string()),
                    ("id", id.to_string()),
                ]);
                (self.fetch_items(request).await?, false)
            }
        };

        let last_modified = items
            .iter()
            .map(|i| i.last_modified)
            .max()
            .unwrap_or(0)
            .max(cursor.last_modified);
        let full_page = backlog && items.len() >= self.batch_size as usize;
        let next_offset = if full_page {
            items.iter().map(|i| i.id).max().or(cursor.offset)
        } else {
            None
        };

        let next = Cursor {
            offset: next_offset,
            last_modified,
        };

        Ok(EntryPage {
            entries: items.into_iter().map(RemoteEntry::from).collect(),
            next_cursor: Some(serde_json::to_string(&next)?),
            has_more: full_page,
        })
    }

    async fn set_entry_flag(&self, entry_id: &str, flag: EntryFlag, value: bool) -> Result<(), RemoteError> {
        let id = numeric_id("entry", entry_id)?;
        let action = match (flag, value) {
            (EntryFlag::Read, true) => "read",
            (EntryFlag::Read, false) => "unread",
            (EntryFlag::Starred, true) => "star",
            (EntryFlag::Starred, false) => "unstar",
        };
        http::send(self.request(reqwest::Method::PUT, &format!("items/{id}/{action}"))).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BASE: &str = "/index.php/apps/news/api/v1-3";

    fn client(server: &MockServer, batch_size: u32) -> NextcloudClient {
        NextcloudClient::new(
            reqwest::Client::new(),
            &server.uri(),
            "alice".to_string(),
            "secret".to_string(),
            batch_size,
        )
    }

    fn item(id: i64, last_modified: serde_json::Value) -> serde_json::Value {
        let enclosure = if id == 1 { "https://example.com/1.mp3" } else { "" };
        json!({
            "id": id,
            "feedId": 7,
            "title": format!("Item {id}"),
            "url": format!("https://example.com/{id}"),
            "author": "",
            "pubDate": 1_700_000_000 + id,
            "body": "<p>body</p>",
            "enclosureMime": "audio/mpeg",
            "enclosureLink": enclosure,
            "unread": id != 2,
            "starred": id == 3,
            "lastModified": last_modified
        })
    }

    #[tokio::test]
    async fn test_list_feeds_uses_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/feeds")))
            .and(basic_auth("alice", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "feeds": [
                    {"id": 7, "url": "https://example.com/rss", "title": "Example", "link": "https://example.com/"},
                    {"id": 8, "url": "https://other.example/rss", "title": ""}
                ],
                "starredCount": 0
            })))
            .mount(&server)
            .await;

        let feeds = client(&server, 50).list_feeds().await.unwrap();
        assert_eq!(
            feeds,
            vec![
                RemoteFeed {
                    id: "7".into(),
                    title: "Example".into(),
                    self_link: "https://example.com/rss".into(),
                    alternate_link: Some("https://example.com/".into()),
                },
                RemoteFeed {
                    id: "8".into(),
                    title: "https://other.example/rss".into(),
                    self_link: "https://other.example/rss".into(),
                    alternate_link: None,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_add_and_rename_feed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{BASE}/feeds")))
            .and(body_json(json!({"url": "https://example.com/rss", "folderId": 0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "feeds": [{"id": 9, "url": "https://example.com/rss", "title": "Example"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("{BASE}/feeds/9/rename")))
            .and(body_json(json!({"feedTitle": "Renamed"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, 50);
        let feed = client.add_feed("https://example.com/rss").await.unwrap();
        assert_eq!(feed.id, "9");
        client.rename_feed("9", "Renamed").await.unwrap();
    }

    #[tokio::test]
    async fn test_backlog_paging_then_incremental() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/items")))
            .and(query_param("offset", "0"))
            .and(query_param("id", "7"))
            .and(query_param("batchSize", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [item(1, json!(100)), item(2, json!("150"))]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/items")))
            .and(query_param("offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [item(3, json!(120))]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/items/updated")))
            .and(query_param("lastModified", "150"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
            .mount(&server)
            .await;

        let client = client(&server, 2);

        let first = client.list_entries("7", None).await.unwrap();
        assert!(first.has_more);
        assert_eq!(first.entries.len(), 2);
        assert!(!first.entries[0].read);
        assert!(first.entries[1].read);
        assert_eq!(first.entries[0].enclosures.len(), 1);
        assert!(first.entries[1].enclosures.is_empty());
        assert_eq!(first.entries[0].author, None);

        let second = client
            .list_entries("7", first.next_cursor.as_deref())
            .await
            .unwrap();
        assert!(!second.has_more);
        assert!(second.entries[0].starred);

        let third = client
            .list_entries("7", second.next_cursor.as_deref())
            .await
            .unwrap();
        assert!(third.entries.is_empty());
        assert!(!third.has_more);
    }

    #[tokio::test]
    async fn test_set_entry_flag_paths() {
        let server = MockServer::start().await;
        for action in ["read", "unread", "star", "unstar"] {
            Mock::given(method("PUT"))
                .and(path(format!("{BASE}/items/42/{action}")))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
        }

        let client = client(&server, 50);
        client.set_entry_flag("42", EntryFlag::Read, true).await.unwrap();
        client.set_entry_flag("42", EntryFlag::Read, false).await.unwrap();
        client.set_entry_flag("42", EntryFlag::Starred, true).await.unwrap();
        client.set_entry_flag("42", EntryFlag::Starred, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_deleted_feed_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/items")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = client(&server, 50).list_entries("7", None).await;
        assert!(matches!(result, Err(RemoteError::NotFound(_))));
    }

    #[test]
    fn test_non_numeric_id_is_not_found() {
        assert!(matches!(numeric_id("feed", "abc"), Err(RemoteError::NotFound(_))));
    }
}
