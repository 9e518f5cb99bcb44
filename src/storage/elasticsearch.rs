//! Elasticsearch adapter (document store side) over the REST API.
//!
//! - Full scan: sliced point-in-time search sorted by `_shard_doc`, resumed
//!   with `search_after`. The cursor carries the PIT id and the sort values.
//! - Change-log: a separate index with `time_shard`, `cluster_shard`,
//!   `timestamp`, `id` and `version` fields, queried per partition.
//! - Writes: `_bulk` with `version_type=external`, so a write lands only if
//!   its version is strictly greater than the stored one.
//!
//! The change-log index is created on connect when missing, with `id` as a
//! keyword so it can be sorted on. Retention is the application's job (ILM
//! or a periodic `_delete_by_query` on `timestamp`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::traits::{ScanCursor, ScanPage, ScanSlice, StorageError, SyncStore, WriteOp, WriteOutcome};
use crate::changelog::{ChangeCursor, ChangeLogEntry, ChangePage, ShardKey, TimeWindow};
use crate::config::ElasticsearchSettings;
use crate::record::{Document, FieldValue, RecordSchema};
use crate::resilience::retry::{retry_store_call, RetryConfig};

const PIT_KEEP_ALIVE: &str = "5m";

/// Resume position of a sliced point-in-time scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PitCursor {
    pit: String,
    after: Value,
}

impl PitCursor {
    fn encode(&self) -> Result<ScanCursor, StorageError> {
        serde_json::to_string(self)
            .map(ScanCursor)
            .map_err(|e| StorageError::InvalidCursor(e.to_string()))
    }

    fn decode(cursor: &ScanCursor) -> Result<Self, StorageError> {
        serde_json::from_str(cursor.as_str()).map_err(|e| StorageError::InvalidCursor(e.to_string()))
    }
}

pub struct ElasticsearchStore {
    client: Client,
    hosts: Vec<String>,
    next_host: AtomicUsize,
    index: String,
    doc_type: Option<String>,
    changes_index: String,
    changes_refresh_ms: u64,
    schema: RecordSchema,
}

impl ElasticsearchStore {
    /// Build the client and check the cluster answers, with startup-mode retry.
    pub async fn connect(
        settings: &ElasticsearchSettings,
        schema: RecordSchema,
        call_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let store = Self {
            client,
            hosts: settings.hosts.clone(),
            next_host: AtomicUsize::new(0),
            index: settings.index.clone(),
            doc_type: settings.doc_type.clone(),
            changes_index: settings.changes_index.clone(),
            changes_refresh_ms: settings.refresh_interval_ms,
            schema,
        };

        let info = retry_store_call("elasticsearch_connect", &RetryConfig::startup(), || async {
            let resp = store.client.get(store.url("")).send().await.map_err(http_error)?;
            json_body(resp).await
        })
        .await?;
        store.ensure_changes_index().await?;
        info!(
            hosts = ?store.hosts,
            version = info["version"]["number"].as_str().unwrap_or("unknown"),
            index = %store.index,
            "Connected to Elasticsearch"
        );
        Ok(store)
    }

    /// Round-robin over the configured hosts.
    fn url(&self, path: &str) -> String {
        let i = self.next_host.fetch_add(1, Ordering::Relaxed) % self.hosts.len().max(1);
        let host = self.hosts.get(i).map_or("http://127.0.0.1:9200", String::as_str);
        format!("{}/{}", host.trim_end_matches('/'), path)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, StorageError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(http_error)?;
        json_body(resp).await
    }

    /// Create the change-log index with its mapping unless it already exists.
    pub async fn ensure_changes_index(&self) -> Result<(), StorageError> {
        let mapping = self.changes_index_body();
        let resp = self
            .client
            .put(self.url(&self.changes_index))
            .json(&mapping)
            .send()
            .await
            .map_err(http_error)?;
        if resp.status() == StatusCode::BAD_REQUEST {
            let body: Value = resp.json().await.map_err(http_error)?;
            if body["error"]["type"] == "resource_already_exists_exception" {
                return Ok(());
            }
            return Err(StorageError::Backend(format!("creating {}: {}", self.changes_index, body)));
        }
        json_body(resp).await?;
        info!(index = %self.changes_index, "Created change-log index");
        Ok(())
    }

    /// Settings and mapping for a new change-log index. The refresh interval
    /// is pinned so `scan_lag_ms` can be sized against it.
    fn changes_index_body(&self) -> Value {
        json!({
            "settings": { "index": { "refresh_interval": format!("{}ms", self.changes_refresh_ms) } },
            "mappings": { "properties": {
                "time_shard": { "type": "integer" },
                "cluster_shard": { "type": "integer" },
                "timestamp": { "type": "long" },
                "id": { "type": "keyword" },
                "version": { "type": "long" },
            }},
        })
    }

    /// Index a change-log entry (application write path).
    pub async fn record_change(&self, entry: &ChangeLogEntry) -> Result<(), StorageError> {
        let body = json!({
            "time_shard": entry.key.time_shard,
            "cluster_shard": entry.key.cluster_shard,
            "timestamp": entry.timestamp,
            "id": entry.id,
            "version": entry.version,
        });
        self.post_json(&format!("{}/_doc", self.changes_index), &body).await?;
        Ok(())
    }

    async fn open_pit(&self) -> Result<String, StorageError> {
        let resp = self
            .client
            .post(self.url(&format!("{}/_pit?keep_alive={}", self.index, PIT_KEEP_ALIVE)))
            .send()
            .await
            .map_err(http_error)?;
        let body = json_body(resp).await?;
        body["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Backend("point-in-time response without id".into()))
    }

    async fn close_pit(&self, pit: &str) {
        let result = self
            .client
            .delete(self.url("_pit"))
            .json(&json!({ "id": pit }))
            .send()
            .await;
        if let Err(e) = result {
            debug!(error = %e, "Closing point-in-time failed, it will expire on its own");
        }
    }

    /// Source document of a hit, with the identity filled from `_id` when absent.
    fn hit_document(&self, hit: &Value) -> Document {
        let mut doc = RecordSchema::document_from_json(&hit["_source"]);
        if !doc.contains_key(&self.schema.id_field) {
            if let Some(id) = hit["_id"].as_str() {
                doc.insert(self.schema.id_field.clone(), FieldValue::Str(id.to_string()));
            }
        }
        doc
    }

    /// NDJSON body of a `_bulk` request.
    fn bulk_body(&self, ops: &[WriteOp]) -> String {
        let mut body = String::new();
        for op in ops {
            let mut meta = json!({
                "_index": self.index,
                "_id": op.id(),
                "version": op.version(),
                "version_type": "external",
            });
            if let Some(ref doc_type) = self.doc_type {
                meta["_type"] = Value::String(doc_type.clone());
            }
            match op {
                WriteOp::Upsert(record) => {
                    body.push_str(&json!({ "index": meta }).to_string());
                    body.push('\n');
                    body.push_str(&self.schema.to_json(record).to_string());
                    body.push('\n');
                }
                WriteOp::Delete { .. } => {
                    body.push_str(&json!({ "delete": meta }).to_string());
                    body.push('\n');
                }
            }
        }
        body
    }
}

fn http_error(e: reqwest::Error) -> StorageError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        StorageError::Transient(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

async fn json_body(resp: Response) -> Result<Value, StorageError> {
    let status = resp.status();
    if status.is_success() {
        return resp.json().await.map_err(http_error);
    }
    let body = resp.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(StorageError::Transient(format!("{}: {}", status, body)))
    } else {
        Err(StorageError::Backend(format!("{}: {}", status, body)))
    }
}

/// Per-item outcomes of a `_bulk` response, in request order.
fn parse_bulk_response(body: &Value, expected: usize) -> Result<Vec<WriteOutcome>, StorageError> {
    let items = body["items"]
        .as_array()
        .ok_or_else(|| StorageError::Backend("bulk response without items".into()))?;
    if items.len() != expected {
        return Err(StorageError::Backend(format!(
            "bulk response has {} items for {} operations",
            items.len(),
            expected
        )));
    }

    Ok(items
        .iter()
        .map(|item| {
            let (action, result) = item
                .as_object()
                .and_then(|o| o.iter().next())
                .map_or(("", &Value::Null), |(k, v)| (k.as_str(), v));
            match result["status"].as_u64() {
                Some(200 | 201) => WriteOutcome::Applied,
                Some(409) => WriteOutcome::RejectedStale,
                // Deleting something that is not there leaves the index as intended
                Some(404) if action == "delete" => WriteOutcome::Applied,
                Some(status) => WriteOutcome::Failed(format!(
                    "{}: {}",
                    status,
                    result["error"]["type"].as_str().unwrap_or("unknown error")
                )),
                None => WriteOutcome::Failed("bulk item without status".to_string()),
            }
        })
        .collect())
}

/// Change-log row of a hit, taken from its sort values (the partition order
/// the next page resumes from), or from `_source` when the hit carries none.
fn change_entry(key: ShardKey, hit: &Value) -> Result<ChangeLogEntry, StorageError> {
    let position = match hit["sort"].as_array() {
        Some(sort) if sort.len() == 3 => [&sort[0], &sort[1], &sort[2]],
        _ => {
            let source = &hit["_source"];
            [&source["timestamp"], &source["id"], &source["version"]]
        }
    };
    let [timestamp, id, version] = position;
    let unreadable = || StorageError::Backend(format!("unreadable change-log hit: {}", hit));
    Ok(ChangeLogEntry {
        key,
        timestamp: timestamp.as_i64().ok_or_else(unreadable)?,
        id: match id {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return Err(unreadable()),
        },
        version: version.as_i64().ok_or_else(unreadable)?,
    })
}

#[async_trait]
impl SyncStore for ElasticsearchStore {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn scan_page(
        &self,
        slice: ScanSlice,
        cursor: Option<&ScanCursor>,
        limit: usize,
    ) -> Result<ScanPage, StorageError> {
        let (pit, after) = match cursor {
            Some(c) => {
                let decoded = PitCursor::decode(c)?;
                (decoded.pit, Some(decoded.after))
            }
            None => (self.open_pit().await?, None),
        };

        let mut body = json!({
            "size": limit,
            "pit": { "id": pit, "keep_alive": PIT_KEEP_ALIVE },
            "sort": [{ "_shard_doc": "asc" }],
            "track_total_hits": false,
        });
        if slice.count > 1 {
            body["slice"] = json!({ "id": slice.index, "max": slice.count });
        }
        if let Some(after) = after {
            body["search_after"] = after;
        }

        let resp = self.post_json("_search", &body).await?;
        let pit = resp["pit_id"].as_str().map_or(pit, str::to_string);
        let hits = resp["hits"]["hits"].as_array().cloned().unwrap_or_default();
        let documents = hits.iter().map(|hit| self.hit_document(hit)).collect();

        let next = match hits.last() {
            Some(last) if hits.len() >= limit => Some(
                PitCursor {
                    pit,
                    after: last["sort"].clone(),
                }
                .encode()?,
            ),
            _ => {
                self.close_pit(&pit).await;
                None
            }
        };
        Ok(ScanPage { documents, next })
    }

    async fn read_changes(
        &self,
        key: ShardKey,
        window: TimeWindow,
        after: Option<&ChangeCursor>,
        limit: usize,
    ) -> Result<ChangePage, StorageError> {
        let mut body = json!({
            "size": limit,
            "query": { "bool": { "filter": [
                { "term": { "time_shard": key.time_shard } },
                { "term": { "cluster_shard": key.cluster_shard } },
                { "range": { "timestamp": { "gt": window.after, "lte": window.upto } } },
                { "exists": { "field": "id" } },
                { "exists": { "field": "version" } },
            ]}},
            "sort": [{ "timestamp": "asc" }, { "id": "asc" }, { "version": "asc" }],
        });
        if let Some(after) = after {
            body["search_after"] = json!([after.timestamp, after.id, after.version]);
        }

        let resp = self.post_json(&format!("{}/_search", self.changes_index), &body).await?;
        let hits = resp["hits"]["hits"].as_array().cloned().unwrap_or_default();
        let rows = hits
            .iter()
            .map(|hit| change_entry(key, hit))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ChangePage::from_rows(rows, hits.len() >= limit))
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Document>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self.post_json(&format!("{}/_mget", self.index), &json!({ "ids": ids })).await?;
        Ok(resp["docs"]
            .as_array()
            .map(|docs| {
                docs.iter()
                    .filter(|doc| doc["found"].as_bool() == Some(true))
                    .map(|doc| self.hit_document(doc))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn write_batch(&self, ops: &[WriteOp]) -> Result<Vec<WriteOutcome>, StorageError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .client
            .post(self.url("_bulk"))
            .header("Content-Type", "application/x-ndjson")
            .body(self.bulk_body(ops))
            .send()
            .await
            .map_err(http_error)?;
        let body = json_body(resp).await?;
        parse_bulk_response(&body, ops.len())
    }
}
