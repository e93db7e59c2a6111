//! Exchange replay from JSONL scripts
//!
//! Drives a [`DataTracingFilter`] with a recorded or hand-written sequence of
//! request and response events, without a host proxy. Each line is one
//! event:
//!
//! ```text
//! {"event":"request","stream":1,"connection":7,"headers":{"x-request-id":"r1"}}
//! {"event":"response","stream":1,"headers":{"x-data":"pii"}}
//! ```
//!
//! Streams pair a response with its request. A stream ends with its
//! response, or with its request when the request is rejected.

use crate::filter::{DataTracingFilter, ExchangeContext, FilterStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

/// Replay errors
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid event on line {line}: {source}")]
    InvalidEvent {
        line: u64,
        #[source]
        source: serde_json::Error,
    },
}

/// One scripted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReplayEvent {
    Request {
        stream: u64,
        connection: u64,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Response {
        stream: u64,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Result of replaying one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayOutcome {
    /// Line number in the script (1-based)
    pub line: u64,
    /// "request" or "response"
    pub event: &'static str,
    pub stream: u64,
    /// Trace the exchange belongs to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// "continue" or "reset"
    pub status: &'static str,
    /// Rejection reason, for resets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Headers as forwarded after the filter ran
    pub headers: BTreeMap<String, String>,
}

/// Replays events against a filter, tracking open streams
pub struct ExchangeReplay {
    filter: Arc<DataTracingFilter>,
    streams: HashMap<u64, ExchangeContext>,
    line: u64,
}

impl ExchangeReplay {
    pub fn new(filter: Arc<DataTracingFilter>) -> Self {
        Self {
            filter,
            streams: HashMap::new(),
            line: 0,
        }
    }

    pub fn filter(&self) -> &Arc<DataTracingFilter> {
        &self.filter
    }

    /// Streams whose request was seen but whose response was not
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Apply a single event
    pub fn apply(&mut self, event: ReplayEvent) -> ReplayOutcome {
        self.line += 1;

        match event {
            ReplayEvent::Request {
                stream,
                connection,
                mut headers,
            } => {
                let mut ctx = ExchangeContext::new(connection);
                let status = self.filter.on_request(&mut ctx, &mut headers);
                let trace_id = ctx.trace_id().map(str::to_string);
                if status.is_continue() {
                    self.streams.insert(stream, ctx);
                } else {
                    self.streams.remove(&stream);
                }
                self.outcome("request", stream, trace_id, status, headers)
            }
            ReplayEvent::Response {
                stream,
                mut headers,
            } => {
                let ctx = self.streams.remove(&stream).unwrap_or_else(|| {
                    debug!(stream = stream, "Response for unknown stream");
                    ExchangeContext::default()
                });
                let status = self.filter.on_response(&ctx, &mut headers);
                let trace_id = ctx.trace_id().map(str::to_string);
                self.outcome("response", stream, trace_id, status, headers)
            }
        }
    }

    /// Replay a JSONL script held in memory
    pub fn run_str(&mut self, script: &str) -> Result<Vec<ReplayOutcome>, ReplayError> {
        let mut outcomes = Vec::new();
        for line in script.lines() {
            if let Some(outcome) = self.apply_line(line)? {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    /// Replay a JSONL script file
    pub async fn run_file(&mut self, path: &Path) -> Result<Vec<ReplayOutcome>, ReplayError> {
        let file = tokio::fs::File::open(path).await?;
        let mut lines = BufReader::new(file).lines();

        info!(path = %path.display(), "Starting replay");

        let mut outcomes = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if let Some(outcome) = self.apply_line(&line)? {
                outcomes.push(outcome);
            }
        }

        info!(
            events = outcomes.len(),
            open_streams = self.streams.len(),
            "Replay complete"
        );
        Ok(outcomes)
    }

    /// Parse and apply one line. Blank lines and `#` comments are skipped
    /// but still counted.
    fn apply_line(&mut self, line: &str) -> Result<Option<ReplayOutcome>, ReplayError> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            self.line += 1;
            return Ok(None);
        }

        let event: ReplayEvent =
            serde_json::from_str(trimmed).map_err(|source| ReplayError::InvalidEvent {
                line: self.line + 1,
                source,
            })?;
        Ok(Some(self.apply(event)))
    }

    fn outcome(
        &self,
        event: &'static str,
        stream: u64,
        trace_id: Option<String>,
        status: FilterStatus,
        headers: HashMap<String, String>,
    ) -> ReplayOutcome {
        let (status, reason) = match status {
            FilterStatus::Continue => ("continue", None),
            FilterStatus::Reset(err) => ("reset", Some(err.to_string())),
        };
        ReplayOutcome {
            line: self.line,
            event,
            stream,
            trace_id,
            status,
            reason,
            headers: headers.into_iter().collect(),
        }
    }
}
