//! Source connectors
//!
//! A source is a lazy, finite sequence of records, optionally restricted to
//! records changed after an incremental cursor. `enrich` is the hook for any
//! per-record call back into the source API (e.g. fetching attachments). When a
//! source reports that it enriches, the processor runs the hook under the rate
//! limiter and the retry wrapper.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;

use syncflow_common::types::Record;

use crate::error::{SyncError, SyncResult};
use crate::retry::CredentialRefresher;

/// Records yielded by a source
pub type RecordStream = BoxStream<'static, SyncResult<Record>>;

#[async_trait]
pub trait Source: Send + Sync {
    /// Short name, also the rate-limit scope for calls against this source
    fn name(&self) -> &str;

    /// Open the record sequence; `cursor` limits it to records changed after it
    async fn records(&self, cursor: Option<DateTime<Utc>>) -> SyncResult<RecordStream>;

    /// Whether `enrich` calls back into the source API
    ///
    /// Only enriching sources spend rate-limit tokens per record.
    fn enriches(&self) -> bool {
        false
    }

    /// Per-record follow-up call against the source API
    async fn enrich(&self, record: Record) -> SyncResult<Record> {
        Ok(record)
    }

    /// Refresher for the source credential, if it can be refreshed
    fn credential_refresher(&self) -> Option<Arc<dyn CredentialRefresher>> {
        None
    }
}

fn changed_since(record: &Record, cursor: Option<DateTime<Utc>>) -> bool {
    match (cursor, record.last_modified()) {
        (Some(cursor), Some(modified)) => modified > cursor,
        _ => true,
    }
}

/// Source over records held in memory
#[derive(Debug, Clone)]
pub struct VecSource {
    name: String,
    records: Vec<Record>,
}

impl VecSource {
    pub fn new(name: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            name: name.into(),
            records,
        }
    }
}

#[async_trait]
impl Source for VecSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn records(&self, cursor: Option<DateTime<Utc>>) -> SyncResult<RecordStream> {
        let records: Vec<SyncResult<Record>> = self
            .records
            .iter()
            .filter(|r| changed_since(r, cursor))
            .cloned()
            .map(Ok)
            .collect();
        Ok(stream::iter(records).boxed())
    }
}

/// Source reading one JSON record per line from a file
#[derive(Debug, Clone)]
pub struct JsonlSource {
    name: String,
    path: PathBuf,
}

impl JsonlSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl Source for JsonlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn records(&self, cursor: Option<DateTime<Utc>>) -> SyncResult<RecordStream> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            SyncError::Configuration(format!("cannot open {}: {e}", self.path.display()))
        })?;
        let reader = serde_jsonlines::AsyncJsonLinesReader::new(tokio::io::BufReader::new(file));

        let records = reader
            .read_all::<Record>()
            .map(|line| {
                line.map_err(|e| match e.kind() {
                    std::io::ErrorKind::InvalidData => {
                        SyncError::Validation(format!("malformed record line: {e}"))
                    },
                    _ => SyncError::Transient(format!("read error: {e}")),
                })
            })
            .filter(move |line| {
                let keep = match line {
                    Ok(record) => changed_since(record, cursor),
                    Err(_) => true,
                };
                futures::future::ready(keep)
            });
        Ok(records.boxed())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::io::Write;

    #[tokio::test]
    async fn test_vec_source_cursor_filter() {
        let old = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let source = VecSource::new(
            "asana",
            vec![
                Record::new("1", "task", json!({})).with_updated_at(old),
                Record::new("2", "task", json!({})).with_updated_at(new),
                Record::new("3", "task", json!({})),
            ],
        );

        let all: Vec<Record> = source.records(None).await.unwrap().try_collect().await.unwrap();
        assert_eq!(all.len(), 3);

        let cursor = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let changed: Vec<Record> =
            source.records(Some(cursor)).await.unwrap().try_collect().await.unwrap();
        let keys: Vec<&str> = changed.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn test_jsonl_source_reads_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"key": "1", "record_type": "task", "payload": {{"title": "One"}}}}"#).unwrap();
        writeln!(file, r#"{{"key": "2", "record_type": "task", "payload": {{"title": "Two"}}}}"#).unwrap();
        file.flush().unwrap();

        let source = JsonlSource::new("file", file.path());
        let records: Vec<Record> = source.records(None).await.unwrap().try_collect().await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].display_name().as_deref(), Some("Two"));
    }

    #[tokio::test]
    async fn test_jsonl_source_missing_file() {
        let source = JsonlSource::new("file", "/definitely/not/here.jsonl");
        assert!(matches!(source.records(None).await, Err(SyncError::Configuration(_))));
    }
}
