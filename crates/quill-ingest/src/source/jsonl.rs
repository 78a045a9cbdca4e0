//! JSONL replay gateway.
//!
//! Reads chat events from a JSONL file (one JSON event per line) and
//! replays them through the [`Gateway`] seam. Used for backfill and local
//! runs, and as a realistic resumable source in tests: the cursor is the
//! line offset, so a reconnect resumes exactly where the previous
//! connection left off.

use super::{Cursor, Gateway, GatewayConnection};
use crate::{Error, Result};
use async_trait::async_trait;
use quill_core::RawEvent;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

/// Configuration for the JSONL replay gateway.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    /// Input file path.
    pub input: PathBuf,
}

/// JSONL file event gateway.
pub struct JsonlGateway {
    config: JsonlConfig,
}

impl JsonlGateway {
    /// Create a new JSONL gateway for the given file.
    pub fn new(config: JsonlConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Gateway for JsonlGateway {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn supports_resume(&self) -> bool {
        true
    }

    async fn connect(&self, resume: Option<&Cursor>) -> Result<Box<dyn GatewayConnection>> {
        let skip = match resume {
            Some(cursor) => cursor
                .0
                .parse::<u64>()
                .map_err(|_| Error::Gateway(format!("invalid replay cursor: {}", cursor.0)))?,
            None => 0,
        };

        let file = File::open(&self.config.input).await.map_err(|e| {
            Error::Gateway(format!(
                "cannot open replay file {}: {}",
                self.config.input.display(),
                e
            ))
        })?;

        let mut lines = BufReader::new(file).lines();
        for _ in 0..skip {
            if lines.next_line().await?.is_none() {
                break;
            }
        }

        Ok(Box::new(JsonlConnection { lines, line: skip }))
    }
}

struct JsonlConnection {
    lines: Lines<BufReader<File>>,
    /// Lines consumed so far; doubles as the resume cursor.
    line: u64,
}

#[async_trait]
impl GatewayConnection for JsonlConnection {
    async fn next_event(&mut self) -> Result<Option<RawEvent>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            self.line += 1;

            if line.trim().is_empty() {
                continue;
            }

            return match serde_json::from_str::<RawEvent>(&line) {
                Ok(event) => Ok(Some(event)),
                Err(e) => Err(Error::Decode(format!("line {}: {}", self.line, e))),
            };
        }
    }

    fn cursor(&self) -> Option<Cursor> {
        Some(Cursor(self.line.to_string()))
    }
}
