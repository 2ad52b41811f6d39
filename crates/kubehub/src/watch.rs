//! Watch channel: newline-delimited JSON watch records to typed events.

use std::collections::VecDeque;

use bytes::BytesMut;
use futures::StreamExt;
use kestrel_core::{ChangeType, ResourceDescriptor, ResourceVersion, StoreError, StoreResult, WatchEvent, WatchNotification};
use metrics::counter;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::ByteStream;

/// Longest unterminated record the channel buffers before giving up.
pub const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: Value,
}

fn resource_version_of(object: &Value) -> ResourceVersion {
    object
        .get("metadata")
        .and_then(|m| m.get("resourceVersion"))
        .and_then(Value::as_str)
        .map(ResourceVersion::from)
        .unwrap_or_default()
}

/// Decode one record. `Ok(None)` for blank lines.
pub fn decode_record(line: &[u8]) -> StoreResult<Option<WatchEvent<Value>>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let rec: RawRecord = serde_json::from_slice(line).map_err(|e| StoreError::Malformed(format!("watch record: {e}")))?;
    let change = match rec.kind.as_str() {
        "ADDED" => ChangeType::Added,
        "MODIFIED" => ChangeType::Modified,
        "DELETED" => ChangeType::Deleted,
        "BOOKMARK" => return Ok(Some(WatchEvent::Bookmark(resource_version_of(&rec.object)))),
        "ERROR" => {
            let code = rec.object.get("code").and_then(Value::as_u64).unwrap_or(0);
            let reason = rec.object.get("reason").and_then(Value::as_str).unwrap_or("");
            let message = rec.object.get("message").and_then(Value::as_str).unwrap_or("");
            if code == 410 || reason == "Expired" || reason == "Gone" {
                return Ok(Some(WatchEvent::Gone));
            }
            let code = u16::try_from(code).unwrap_or(500);
            return Err(StoreError::from_status(code, format!("{reason}: {message}")));
        }
        other => return Err(StoreError::Malformed(format!("unknown watch record type {other}"))),
    };
    let resource_version = resource_version_of(&rec.object);
    Ok(Some(WatchEvent::Notification(WatchNotification { change, object: rec.object, resource_version })))
}

/// Live change stream for one source, decoded with the source's descriptor.
///
/// Malformed records are logged and skipped. The channel ends after `Gone`,
/// after a server-side error record, after a record longer than the
/// buffer limit, or when the byte stream ends.
pub struct WatchChannel<T> {
    body: ByteStream,
    buf: BytesMut,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
    max_record: usize,
    lines: VecDeque<BytesMut>,
    failed: Option<StoreError>,
    descriptor: ResourceDescriptor<T>,
    done: bool,
}

impl<T> WatchChannel<T> {
    pub fn new(body: ByteStream, descriptor: ResourceDescriptor<T>) -> Self {
        Self {
            body,
            buf: BytesMut::new(),
            scanned: 0,
            max_record: MAX_RECORD_BYTES,
            lines: VecDeque::new(),
            failed: None,
            descriptor,
            done: false,
        }
    }

    pub fn with_max_record(mut self, bytes: usize) -> Self {
        self.max_record = bytes;
        self
    }

    fn split_lines(&mut self) -> StoreResult<()> {
        while let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(self.scanned + offset);
            let _ = self.buf.split_to(1);
            self.scanned = 0;
            self.lines.push_back(line);
        }
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_record {
            return Err(StoreError::Malformed(format!("unterminated watch record over {} bytes", self.max_record)));
        }
        Ok(())
    }

    /// Next decoded event; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<StoreResult<WatchEvent<T>>> {
        loop {
            if let Some(line) = self.lines.pop_front() {
                match self.decode_line(&line) {
                    Some(Ok(WatchEvent::Gone)) => {
                        self.done = true;
                        self.lines.clear();
                        return Some(Ok(WatchEvent::Gone));
                    }
                    Some(Err(e)) => {
                        self.done = true;
                        self.lines.clear();
                        return Some(Err(e));
                    }
                    Some(ev) => return Some(ev),
                    None => continue,
                }
            }
            if let Some(e) = self.failed.take() {
                return Some(Err(e));
            }
            if self.done {
                return None;
            }
            match self.body.next().await {
                Some(Ok(chunk)) => {
                    self.buf.extend_from_slice(&chunk);
                    if let Err(e) = self.split_lines() {
                        counter!("store_malformed_total", 1u64, "phase" => "watch");
                        warn!(kind = %self.descriptor.identity, error = %e, "watch record too large; closing");
                        self.buf.clear();
                        self.scanned = 0;
                        self.done = true;
                        self.failed = Some(e);
                    }
                }
                Some(Err(e)) => {
                    warn!(kind = %self.descriptor.identity, error = %e, "watch stream error");
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    debug!(kind = %self.descriptor.identity, "watch stream ended");
                    self.done = true;
                    if !self.buf.is_empty() {
                        let tail = self.buf.split();
                        self.lines.push_back(tail);
                    }
                }
            }
        }
    }

    /// `None` when the line is blank or was skipped as malformed.
    fn decode_line(&self, line: &[u8]) -> Option<StoreResult<WatchEvent<T>>> {
        let raw = match decode_record(line) {
            Ok(Some(ev)) => ev,
            Ok(None) => return None,
            Err(StoreError::Malformed(msg)) => {
                counter!("store_malformed_total", 1u64, "phase" => "watch");
                warn!(kind = %self.descriptor.identity, error = %msg, "skipping malformed watch record");
                return None;
            }
            Err(e) => return Some(Err(e)),
        };
        Some(Ok(match raw {
            WatchEvent::Notification(n) => match self.descriptor.decode(n.object) {
                Ok(object) => WatchEvent::Notification(WatchNotification { change: n.change, object, resource_version: n.resource_version }),
                Err(e) => {
                    counter!("store_malformed_total", 1u64, "phase" => "watch");
                    warn!(kind = %self.descriptor.identity, error = %e, "skipping undecodable watch object");
                    return None;
                }
            },
            WatchEvent::Bookmark(rv) => WatchEvent::Bookmark(rv),
            WatchEvent::Gone => WatchEvent::Gone,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use kestrel_core::{KubeObject, ResourceObject};

    fn descriptor() -> ResourceDescriptor<ResourceObject> {
        ResourceDescriptor::dynamic("rbac.authorization.k8s.io/v1", "Role", "roles", true)
    }

    fn channel(chunks: Vec<&'static str>) -> WatchChannel<ResourceObject> {
        let body = stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes())))).boxed();
        WatchChannel::new(body, descriptor())
    }

    #[tokio::test]
    async fn splits_records_across_chunks_and_flushes_tail() {
        let mut ch = channel(vec![
            r#"{"type":"ADDED","object":{"kind":"Role","metadata":{"uid":"a","name":"x","resourceVersion":"1"}}}"#,
            "\n{\"type\":\"MODIFIED\",\"object\":{\"kind\":\"Role\",\"metadata\":",
            r#"{"uid":"a","name":"y","resourceVersion":"2"}}}"#,
        ]);
        let Some(Ok(WatchEvent::Notification(first))) = ch.next().await else { panic!("expected notification") };
        assert_eq!(first.change, ChangeType::Added);
        assert_eq!(first.object.name(), "x");
        let Some(Ok(WatchEvent::Notification(second))) = ch.next().await else { panic!("expected notification") };
        assert_eq!(second.change, ChangeType::Modified);
        assert_eq!(second.resource_version.as_str(), "2");
        assert!(ch.next().await.is_none());
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let mut ch = channel(vec![
            "not json\n",
            "{\"type\":\"ADDED\",\"object\":{\"kind\":\"Role\",\"metadata\":{\"name\":\"no-uid\"}}}\n",
            "\n",
            "{\"type\":\"DELETED\",\"object\":{\"kind\":\"Role\",\"metadata\":{\"uid\":\"b\",\"name\":\"z\",\"resourceVersion\":\"5\"}}}\n",
        ]);
        let Some(Ok(WatchEvent::Notification(n))) = ch.next().await else { panic!("expected notification") };
        assert_eq!(n.change, ChangeType::Deleted);
        assert_eq!(n.object.uid(), "b");
        assert!(ch.next().await.is_none());
    }

    #[tokio::test]
    async fn expired_error_record_is_gone_and_terminal() {
        let mut ch = channel(vec![
            "{\"type\":\"ERROR\",\"object\":{\"kind\":\"Status\",\"code\":410,\"reason\":\"Expired\",\"message\":\"too old resource version\"}}\n",
            "{\"type\":\"ADDED\",\"object\":{\"kind\":\"Role\",\"metadata\":{\"uid\":\"a\",\"name\":\"x\"}}}\n",
        ]);
        assert!(matches!(ch.next().await, Some(Ok(WatchEvent::Gone))));
        assert!(ch.next().await.is_none());
    }

    #[tokio::test]
    async fn oversized_record_ends_the_channel_after_earlier_records() {
        let mut ch = channel(vec![
            "{\"type\":\"ADDED\",\"object\":{\"kind\":\"Role\",\"metadata\":{\"uid\":\"a\",\"name\":\"x\"}}}\n{\"type\":",
            "\"MODIFIED\",\"object\":{\"kind\":\"Role\",\"metadata\":{\"uid\":\"a\",",
            "\"name\":\"y\",\"labels\":{\"padding\":\"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx\"",
        ])
        .with_max_record(96);
        assert!(matches!(ch.next().await, Some(Ok(WatchEvent::Notification(_)))));
        assert!(matches!(ch.next().await, Some(Err(StoreError::Malformed(_)))));
        assert!(ch.next().await.is_none());
    }

    #[tokio::test]
    async fn records_split_over_many_chunks_are_reassembled() {
        let record = b"{\"type\":\"ADDED\",\"object\":{\"kind\":\"Role\",\"metadata\":{\"uid\":\"a\",\"name\":\"x\"}}}\n";
        let chunks: Vec<_> = record.chunks(7).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
        let mut ch = WatchChannel::new(stream::iter(chunks).boxed(), descriptor());
        let Some(Ok(WatchEvent::Notification(n))) = ch.next().await else { panic!("expected notification") };
        assert_eq!(n.object.name(), "x");
        assert!(ch.next().await.is_none());
    }

    #[tokio::test]
    async fn bookmarks_carry_version() {
        let mut ch = channel(vec!["{\"type\":\"BOOKMARK\",\"object\":{\"kind\":\"Role\",\"metadata\":{\"resourceVersion\":\"77\"}}}\n"]);
        match ch.next().await {
            Some(Ok(WatchEvent::Bookmark(rv))) => assert_eq!(rv.as_str(), "77"),
            _ => panic!("expected bookmark"),
        }
    }

    #[tokio::test]
    async fn other_error_records_surface_typed() {
        let mut ch = channel(vec!["{\"type\":\"ERROR\",\"object\":{\"code\":403,\"reason\":\"Forbidden\",\"message\":\"no\"}}\n"]);
        assert!(matches!(ch.next().await, Some(Err(StoreError::Forbidden(_)))));
        assert!(ch.next().await.is_none());
    }

    #[tokio::test]
    async fn transport_errors_end_the_channel() {
        let body = async_stream::stream! {
            yield Ok(Bytes::from_static(b"{\"type\":\"ADDED\",\"object\":{\"kind\":\"Role\",\"metadata\":{\"uid\":\"a\",\"name\":\"x\"}}}\n"));
            yield Err(StoreError::NetworkTransient("connection reset".into()));
        }
        .boxed();
        let mut ch = WatchChannel::new(body, descriptor());
        assert!(matches!(ch.next().await, Some(Ok(WatchEvent::Notification(_)))));
        assert!(matches!(ch.next().await, Some(Err(StoreError::NetworkTransient(_)))));
        assert!(ch.next().await.is_none());
    }
}
