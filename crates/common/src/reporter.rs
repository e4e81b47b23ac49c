// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Reverse Tunnel Contributors

// Reporter - the user-facing log sink for tunnel progress and errors

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tracing::debug;

/// Sink for status and error lines.
///
/// Implementations must accept calls from any task concurrently and must
/// not block the caller for longer than it takes to enqueue one line.
pub trait Reporter: Send + Sync {
    fn report(&self, line: &str);
}

impl<R: Reporter + ?Sized> Reporter for Arc<R> {
    fn report(&self, line: &str) {
        (**self).report(line)
    }
}

/// A single timestamped line
#[derive(Debug, Clone)]
pub struct ReportLine {
    pub timestamp: DateTime<Local>,
    pub message: String,
}

impl ReportLine {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ReportLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Reporter backed by an unbounded channel: many producers, one consumer.
///
/// Each line is stamped when reported and enqueued whole, so lines from
/// different tasks never interleave.
#[derive(Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ReportLine>,
}

impl ChannelReporter {
    /// Create a reporter and the receiving end its consumer drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReportLine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Reporter for ChannelReporter {
    fn report(&self, line: &str) {
        if self.tx.send(ReportLine::now(line)).is_err() {
            debug!("Report consumer is gone, dropping line: {}", line);
        }
    }
}

/// Reporter that keeps every line in memory (append-only)
#[derive(Debug, Default)]
pub struct MemoryReporter {
    lines: Mutex<Vec<ReportLine>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all lines reported so far
    pub fn lines(&self) -> Vec<ReportLine> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Snapshot of the messages without timestamps
    pub fn messages(&self) -> Vec<String> {
        self.lines().into_iter().map(|l| l.message).collect()
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ReportLine::now(line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_reporter_delivers_lines_in_order() {
        let (reporter, mut rx) = ChannelReporter::new();
        reporter.report("connecting to relay.example:22");
        reporter.report("connected to relay.example:22");
        drop(reporter);

        let mut messages = Vec::new();
        while let Some(line) = rx.recv().await {
            messages.push(line.message);
        }
        assert_eq!(
            messages,
            vec!["connecting to relay.example:22", "connected to relay.example:22"]
        );
    }

    #[test]
    fn test_channel_reporter_survives_dropped_consumer() {
        let (reporter, rx) = ChannelReporter::new();
        drop(rx);
        reporter.report("nobody is listening");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reports_are_whole_lines() {
        let reporter = Arc::new(MemoryReporter::new());

        let mut handles = Vec::new();
        for task in 0..8 {
            let reporter = reporter.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    reporter.report(&format!("task {} line {}", task, i));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let messages = reporter.messages();
        assert_eq!(messages.len(), 400);
        assert!(messages.iter().all(|m| m.starts_with("task ") && m.contains(" line ")));
    }

    #[test]
    fn test_line_format() {
        let line = ReportLine::now("listening on 0.0.0.0:9000");
        let rendered = line.to_string();
        assert!(rendered.ends_with(" | listening on 0.0.0.0:9000"));
        // HH:MM:SS prefix
        assert_eq!(rendered.find(" | "), Some(8));
    }
}
