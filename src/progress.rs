//! Progress reporting.
//!
//! Transfers emit [`ProgressEvent`]s into a [`ProgressSink`]. The terminal sink renders one
//! indicatif bar per blob; the log sink forwards messages to the `log` facade.

use std::{collections::HashMap, sync::Mutex};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::info;

/// A progress update from a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A free-form status line, such as "Copying blob sha256:...".
    Message(String),
    /// Byte progress for one item.
    Bytes {
        id: String,
        current: u64,
        total: Option<u64>,
    },
    /// One item finished.
    Done { id: String },
}

/// Receives progress events.
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);

    /// Called once after a transfer ends, successfully or not.
    fn finish(&self) {}
}

/// Discards all progress.
#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn event(&self, _event: ProgressEvent) {}
}

/// Logs status messages and finished items at info level.
#[derive(Debug, Default)]
pub struct LogProgress;

impl LogProgress {
    /// The line logged for `event`; byte counts are too chatty to log.
    fn message(&self, event: &ProgressEvent) -> Option<String> {
        match event {
            ProgressEvent::Message(message) => Some(message.clone()),
            ProgressEvent::Bytes { .. } => None,
            ProgressEvent::Done { id } => Some(format!("Done {id}")),
        }
    }
}

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        if let Some(message) = self.message(&event) {
            info!("{message}");
        }
    }
}

/// Renders progress bars on the terminal.
pub struct TerminalProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalProgress {
    pub fn new() -> Self {
        TerminalProgress {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar(&self, id: &str, total: Option<u64>) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        bars.entry(id.to_string())
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(total.unwrap_or(0)));
                bar.set_style(
                    ProgressStyle::with_template(
                        "[eta {eta}] {bar:40.cyan/blue} {decimal_bytes:>7}/{decimal_total_bytes:7} {msg}",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("##-"),
                );
                bar.set_message(id.to_string());
                bar
            })
            .clone()
    }
}

impl ProgressSink for TerminalProgress {
    fn event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Message(message) => {
                // println only fails when the terminal is gone
                let _ = self.multi.println(message);
            }
            ProgressEvent::Bytes { id, current, total } => {
                let bar = self.bar(&id, total);
                if let Some(total) = total {
                    bar.set_length(total);
                }
                bar.set_position(current);
            }
            ProgressEvent::Done { id } => {
                let bar = self
                    .bars
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                if let Some(bar) = bar {
                    bar.finish_and_clear();
                }
            }
        }
    }

    fn finish(&self) {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        for (_, bar) in bars.drain() {
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_terminal_bars() {
        let progress = TerminalProgress::new();
        progress.multi.set_draw_target(indicatif::ProgressDrawTarget::hidden());

        progress.event(ProgressEvent::Bytes {
            id: "sha256:aaaa".to_string(),
            current: 10,
            total: Some(100),
        });
        progress.event(ProgressEvent::Bytes {
            id: "sha256:aaaa".to_string(),
            current: 50,
            total: None,
        });
        {
            let bars = progress.bars.lock().unwrap();
            let bar = &bars["sha256:aaaa"];
            assert_eq!(bar.position(), 50);
            assert_eq!(bar.length(), Some(100));
        }

        progress.event(ProgressEvent::Done {
            id: "sha256:aaaa".to_string(),
        });
        assert!(progress.bars.lock().unwrap().is_empty());

        progress.event(ProgressEvent::Bytes {
            id: "sha256:bbbb".to_string(),
            current: 1,
            total: Some(2),
        });
        progress.finish();
        assert!(progress.bars.lock().unwrap().is_empty());
    }

    #[test]
    fn test_log_progress() {
        let progress = LogProgress;
        assert_eq!(
            progress.message(&ProgressEvent::Message("Copying blob sha256:aaaa".into())),
            Some("Copying blob sha256:aaaa".to_string())
        );
        assert_eq!(
            progress.message(&ProgressEvent::Bytes {
                id: "sha256:aaaa".to_string(),
                current: 1,
                total: None,
            }),
            None
        );
        assert_eq!(
            progress.message(&ProgressEvent::Done {
                id: "sha256:aaaa".to_string(),
            }),
            Some("Done sha256:aaaa".to_string())
        );
        progress.event(ProgressEvent::Message("logged".into()));
        progress.finish();
    }
}
