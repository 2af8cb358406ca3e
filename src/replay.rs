//! JSON-lines replay
//!
//! Each input line is one of:
//!
//! - a datastore update, tagged by `kind` (see [`Update`])
//! - `{"status": "in_sync"}` or `{"status": "not_ready"}`
//! - `{"match": {...}}` carrying a label index match event
//!
//! Blank lines and lines starting with `#` are skipped. Dataplane messages
//! are written one JSON object per line.

use std::mem;

use serde::Deserialize;
use strata_calc::async_graph::AsyncCalcGraph;
use strata_calc::labels::MatchEvent;
use strata_calc::{DataplaneMessage, GraphInput};
use strata_common::model::Update;
use strata_common::{Error, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Status {
    InSync,
    NotReady,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReplayLine {
    Status {
        status: Status,
    },
    Match {
        #[serde(rename = "match")]
        event: MatchEvent,
    },
    Update(Update),
}

/// Parse one input line; None for blank and comment lines
pub fn parse_line(line_no: usize, line: &str) -> Result<Option<GraphInput>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let parsed: ReplayLine = serde_json::from_str(trimmed)
        .map_err(|e| Error::serialization_at_line(line_no, e.to_string()))?;
    Ok(Some(match parsed {
        ReplayLine::Status {
            status: Status::InSync,
        } => GraphInput::InSync,
        ReplayLine::Status {
            status: Status::NotReady,
        } => GraphInput::NotReady,
        ReplayLine::Match { event } => GraphInput::Match(event),
        ReplayLine::Update(update) => GraphInput::Update(update),
    }))
}

/// Feed every line of `reader` to `graph` in batches; returns the input count
pub async fn read_inputs<R>(reader: R, batch_size: usize, graph: &AsyncCalcGraph) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let batch_size = batch_size.max(1);
    let mut lines = reader.lines();
    let mut batch = Vec::with_capacity(batch_size);
    let mut line_no = 0;
    let mut total = 0;

    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| Error::serialization_at_line(line_no + 1, e.to_string()))?;
        let Some(line) = line else {
            break;
        };
        line_no += 1;
        if let Some(input) = parse_line(line_no, &line)? {
            batch.push(input);
            total += 1;
        }
        if batch.len() >= batch_size {
            debug!(inputs = batch.len(), "sending batch");
            graph.send(mem::take(&mut batch)).await?;
        }
    }
    if !batch.is_empty() {
        graph.send(batch).await?;
    }
    Ok(total)
}

/// Write messages as JSON lines until the channel closes; returns the count
pub async fn write_messages<W>(
    mut rx: mpsc::UnboundedReceiver<DataplaneMessage>,
    mut out: W,
) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut count = 0;
    while let Some(msg) = rx.recv().await {
        let mut line = serde_json::to_vec(&msg).map_err(|e| Error::serialization(e.to_string()))?;
        line.push(b'\n');
        out.write_all(&line)
            .await
            .map_err(|e| Error::internal_with_context("output", e.to_string()))?;
        count += 1;
    }
    out.flush()
        .await
        .map_err(|e| Error::internal_with_context("output", e.to_string()))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_calc::labels::{LabelledItem, MatchTarget};
    use strata_common::model::{EndpointKey, HostEndpointKey, PolicyKey};

    #[test]
    fn test_parse_status_and_comments() {
        assert!(parse_line(1, "").unwrap().is_none());
        assert!(parse_line(2, "# comment").unwrap().is_none());
        assert_eq!(
            parse_line(3, r#"{"status": "in_sync"}"#).unwrap(),
            Some(GraphInput::InSync)
        );
        assert_eq!(
            parse_line(4, r#"{"status": "not_ready"}"#).unwrap(),
            Some(GraphInput::NotReady)
        );
    }

    #[test]
    fn test_parse_update() {
        let line = r#"{"kind": "tier", "key": {"name": "default"}, "value": {"order": 100.0}}"#;
        let Some(GraphInput::Update(update)) = parse_line(1, line).unwrap() else {
            panic!("expected an update");
        };
        assert_eq!(update.kind(), "tier");
        assert!(!update.is_delete());
    }

    #[test]
    fn test_parse_match_event() {
        let event = MatchEvent::Started {
            target: MatchTarget::Policy(PolicyKey::new("default", "p")),
            item: LabelledItem::Endpoint(EndpointKey::Host(HostEndpointKey {
                hostname: "node-a".to_string(),
                endpoint_id: "eth0".to_string(),
            })),
        };
        let line = serde_json::json!({ "match": event }).to_string();
        assert_eq!(
            parse_line(1, &line).unwrap(),
            Some(GraphInput::Match(event))
        );
    }

    #[test]
    fn test_parse_error_carries_line() {
        let err = parse_line(7, "{not json").unwrap_err();
        assert!(err.to_string().contains("serialization"));
        assert!(matches!(err, Error::Serialization { line: Some(7), .. }));
    }

    #[tokio::test]
    async fn test_write_messages() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(DataplaneMessage::InSync).unwrap();
        drop(tx);
        let mut out = Vec::new();
        assert_eq!(write_messages(rx, &mut out).await.unwrap(), 1);
        assert_eq!(String::from_utf8(out).unwrap(), "{\"type\":\"in_sync\"}\n");
    }
}
