use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use url::Url;

use crate::config::StoreSection;
use crate::platform::retry::{NoRefresh, RetryPolicy};
use crate::platform::{PlatformError, PlatformResult};

/// Lowercase two-letter service prefix followed by digits. Anything else is
/// not a video id and must never reach the remote queue.
const VIDEO_ID_PATTERN: &str = "^[a-z][a-z][0-9]+$";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub video_id: String,
    #[serde(default)]
    pub priority: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub video_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInsert {
    pub video_id: String,
    pub priority: bool,
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Returns the queue snapshot in enqueue order (oldest first).
    async fn fetch_queue(&self) -> PlatformResult<Vec<QueueRecord>>;
    async fn delete_queue_item(&self, id: &str) -> PlatformResult<()>;
    async fn insert_queue(&self, entries: &[QueueInsert]) -> PlatformResult<()>;
    async fn fetch_requests(&self) -> PlatformResult<Vec<RequestRecord>>;
    async fn delete_requests(&self, ids: &[String]) -> PlatformResult<()>;
}

/// Work-queue operations the lifecycle loop depends on.
#[async_trait]
pub trait ContentQueue: Send + Sync {
    async fn dequeue(&self) -> PlatformResult<Option<String>>;
    async fn enqueue_normal(&self, video_ids: &[String]) -> PlatformResult<()>;
    async fn enqueue_priority(&self, video_id: &str) -> PlatformResult<()>;
    async fn take_requests(&self) -> PlatformResult<Option<Vec<String>>>;
}

/// Priority entries first, then most-recently-enqueued first within each
/// class. The snapshot arrives oldest-first, so reversing before a stable
/// priority sort yields exactly that order.
pub fn sort_for_dequeue(entries: &mut Vec<QueueRecord>) {
    entries.reverse();
    entries.sort_by_key(|record| !record.priority);
}

#[derive(Default)]
struct QueueCache {
    entries: Vec<QueueRecord>,
    fresh: bool,
}

pub struct RestQueueStore {
    transport: Arc<dyn QueueTransport>,
    retry: RetryPolicy,
    id_pattern: Regex,
    cache: Mutex<QueueCache>,
}

impl RestQueueStore {
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self {
            transport,
            retry: RetryPolicy::new(8),
            id_pattern: Regex::new(VIDEO_ID_PATTERN).expect("the id pattern is a valid regex"),
            cache: Mutex::new(QueueCache::default()),
        }
    }
}

#[async_trait]
impl ContentQueue for RestQueueStore {
    async fn dequeue(&self) -> PlatformResult<Option<String>> {
        let stale = !self.cache.lock().unwrap().fresh;
        if stale {
            let mut entries = self
                .retry
                .run(&NoRefresh, || self.transport.fetch_queue())
                .await?;
            sort_for_dequeue(&mut entries);
            debug!(entries = entries.len(), "refreshed the work-queue snapshot");
            let mut cache = self.cache.lock().unwrap();
            cache.entries = entries;
            cache.fresh = true;
        }

        let record = {
            let mut cache = self.cache.lock().unwrap();
            if cache.entries.is_empty() {
                return Ok(None);
            }
            cache.entries.remove(0)
        };
        // A crash between here and the delete landing replays the item on the
        // next run; accepted.
        self.retry
            .run(&NoRefresh, || self.transport.delete_queue_item(&record.id))
            .await?;
        Ok(Some(record.video_id))
    }

    async fn enqueue_normal(&self, video_ids: &[String]) -> PlatformResult<()> {
        let entries: Vec<QueueInsert> = video_ids
            .iter()
            .filter(|video_id| {
                if self.id_pattern.is_match(video_id) {
                    true
                } else {
                    error!(video_id = %video_id, "dropping an invalid video id from enqueue");
                    false
                }
            })
            .map(|video_id| QueueInsert {
                video_id: video_id.clone(),
                priority: false,
            })
            .collect();
        if entries.is_empty() {
            return Ok(());
        }
        self.retry
            .run(&NoRefresh, || self.transport.insert_queue(&entries))
            .await?;
        self.cache.lock().unwrap().fresh = false;
        Ok(())
    }

    async fn enqueue_priority(&self, video_id: &str) -> PlatformResult<()> {
        if !self.id_pattern.is_match(video_id) {
            error!(video_id = %video_id, "dropping an invalid video id from priority enqueue");
            return Ok(());
        }
        let entries = [QueueInsert {
            video_id: video_id.to_string(),
            priority: true,
        }];
        self.retry
            .run(&NoRefresh, || self.transport.insert_queue(&entries))
            .await?;
        self.cache.lock().unwrap().fresh = false;
        Ok(())
    }

    async fn take_requests(&self) -> PlatformResult<Option<Vec<String>>> {
        let records = self
            .retry
            .run(&NoRefresh, || self.transport.fetch_requests())
            .await?;
        if records.is_empty() {
            return Ok(None);
        }
        let ids: Vec<String> = records.iter().map(|record| record.id.clone()).collect();
        let video_ids: Vec<String> = records
            .into_iter()
            .map(|record| record.video_id)
            .collect();
        // Everything fetched is cleared in one batch.
        self.retry
            .run(&NoRefresh, || self.transport.delete_requests(&ids))
            .await?;
        Ok(Some(video_ids))
    }
}

pub struct HttpQueueTransport {
    http: reqwest::Client,
    queue_url: Url,
    request_url: Url,
    api_key: String,
}

impl HttpQueueTransport {
    pub fn new(store: &StoreSection) -> PlatformResult<Self> {
        let http = reqwest::Client::new();
        Ok(Self {
            http,
            queue_url: Url::parse(&store.queue_url)?,
            request_url: Url::parse(&store.request_url)?,
            api_key: store.api_key.clone(),
        })
    }

    fn item_url(&self, base: &Url, id: &str) -> PlatformResult<Url> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| PlatformError::Malformed {
                operation: "store url",
                detail: "store url cannot carry path segments".to_string(),
            })?
            .push(id);
        Ok(url)
    }
}

const API_KEY_HEADER: &str = "x-apikey";

#[async_trait]
impl QueueTransport for HttpQueueTransport {
    async fn fetch_queue(&self) -> PlatformResult<Vec<QueueRecord>> {
        let resp = self
            .http
            .get(self.queue_url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        resp.error_for_status_ref()?;
        Ok(resp.json().await?)
    }

    async fn delete_queue_item(&self, id: &str) -> PlatformResult<()> {
        let url = self.item_url(&self.queue_url, id)?;
        let resp = self
            .http
            .delete(url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        resp.error_for_status_ref()?;
        Ok(())
    }

    async fn insert_queue(&self, entries: &[QueueInsert]) -> PlatformResult<()> {
        let resp = self
            .http
            .post(self.queue_url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .json(entries)
            .send()
            .await?;
        resp.error_for_status_ref()?;
        Ok(())
    }

    async fn fetch_requests(&self) -> PlatformResult<Vec<RequestRecord>> {
        let resp = self
            .http
            .get(self.request_url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        resp.error_for_status_ref()?;
        Ok(resp.json().await?)
    }

    async fn delete_requests(&self, ids: &[String]) -> PlatformResult<()> {
        let url = self.item_url(&self.request_url, "*")?;
        let resp = self
            .http
            .delete(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(ids)
            .send()
            .await?;
        resp.error_for_status_ref()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, video_id: &str, priority: bool) -> QueueRecord {
        QueueRecord {
            id: id.to_string(),
            video_id: video_id.to_string(),
            priority,
        }
    }

    #[derive(Default)]
    struct InMemoryTransport {
        queue: Mutex<Vec<QueueRecord>>,
        requests: Mutex<Vec<RequestRecord>>,
        deleted_queue_ids: Mutex<Vec<String>>,
        inserted: Mutex<Vec<QueueInsert>>,
        deleted_request_ids: Mutex<Vec<String>>,
        fetches: Mutex<usize>,
    }

    #[async_trait]
    impl QueueTransport for InMemoryTransport {
        async fn fetch_queue(&self) -> PlatformResult<Vec<QueueRecord>> {
            *self.fetches.lock().unwrap() += 1;
            Ok(self.queue.lock().unwrap().clone())
        }

        async fn delete_queue_item(&self, id: &str) -> PlatformResult<()> {
            self.deleted_queue_ids.lock().unwrap().push(id.to_string());
            self.queue.lock().unwrap().retain(|record| record.id != id);
            Ok(())
        }

        async fn insert_queue(&self, entries: &[QueueInsert]) -> PlatformResult<()> {
            self.inserted.lock().unwrap().extend_from_slice(entries);
            Ok(())
        }

        async fn fetch_requests(&self) -> PlatformResult<Vec<RequestRecord>> {
            Ok(self.requests.lock().unwrap().clone())
        }

        async fn delete_requests(&self, ids: &[String]) -> PlatformResult<()> {
            self.deleted_request_ids
                .lock()
                .unwrap()
                .extend_from_slice(ids);
            self.requests.lock().unwrap().clear();
            Ok(())
        }
    }

    #[test]
    fn dequeue_order_is_priority_first_then_most_recent_first() {
        let mut entries = vec![
            record("1", "aa1", true),
            record("2", "bb2", false),
            record("3", "cc3", false),
            record("4", "dd4", true),
        ];
        sort_for_dequeue(&mut entries);
        let order: Vec<&str> = entries.iter().map(|e| e.video_id.as_str()).collect();
        assert_eq!(order, vec!["dd4", "aa1", "cc3", "bb2"]);
    }

    #[tokio::test]
    async fn dequeue_drains_the_snapshot_and_deletes_each_item() {
        let transport = Arc::new(InMemoryTransport::default());
        *transport.queue.lock().unwrap() = vec![
            record("1", "aa1", true),
            record("2", "bb2", false),
            record("3", "cc3", false),
            record("4", "dd4", true),
        ];
        let store = RestQueueStore::new(Arc::clone(&transport) as Arc<dyn QueueTransport>);

        let mut drained = Vec::new();
        while let Some(video_id) = store.dequeue().await.unwrap() {
            drained.push(video_id);
        }
        assert_eq!(drained, vec!["dd4", "aa1", "cc3", "bb2"]);
        assert_eq!(
            transport.deleted_queue_ids.lock().unwrap().as_slice(),
            &["4", "1", "3", "2"]
        );
        // One snapshot served every dequeue.
        assert_eq!(*transport.fetches.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn enqueue_invalidates_the_snapshot() {
        let transport = Arc::new(InMemoryTransport::default());
        let store = RestQueueStore::new(Arc::clone(&transport) as Arc<dyn QueueTransport>);

        assert!(store.dequeue().await.unwrap().is_none());
        store.enqueue_priority("aa1").await.unwrap();
        transport.queue.lock().unwrap().push(record("1", "aa1", true));

        assert_eq!(store.dequeue().await.unwrap().as_deref(), Some("aa1"));
        assert_eq!(*transport.fetches.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn invalid_video_ids_never_reach_the_store() {
        let transport = Arc::new(InMemoryTransport::default());
        let store = RestQueueStore::new(Arc::clone(&transport) as Arc<dyn QueueTransport>);

        store.enqueue_priority("not a video").await.unwrap();
        store
            .enqueue_normal(&["'; DROP".to_string(), "ab123".to_string()])
            .await
            .unwrap();

        let inserted = transport.inserted.lock().unwrap();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].video_id, "ab123");
        assert!(!inserted[0].priority);
    }

    #[tokio::test]
    async fn take_requests_clears_the_fetched_batch() {
        let transport = Arc::new(InMemoryTransport::default());
        *transport.requests.lock().unwrap() = vec![
            RequestRecord {
                id: "r1".into(),
                video_id: "aa1".into(),
            },
            RequestRecord {
                id: "r2".into(),
                video_id: "bb2".into(),
            },
        ];
        let store = RestQueueStore::new(Arc::clone(&transport) as Arc<dyn QueueTransport>);

        let taken = store.take_requests().await.unwrap().unwrap();
        assert_eq!(taken, vec!["aa1", "bb2"]);
        assert_eq!(
            transport.deleted_request_ids.lock().unwrap().as_slice(),
            &["r1", "r2"]
        );
        assert!(store.take_requests().await.unwrap().is_none());
    }
}
