use crate::config::LoggingConfig;
use crate::error::{Result, WafError};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

/// Severity of a security-event record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl EventLevel {
    fn parse(severity: &str) -> EventLevel {
        match severity {
            "debug" => EventLevel::Debug,
            "warn" => EventLevel::Warn,
            "error" => EventLevel::Error,
            _ => EventLevel::Info,
        }
    }
}

/// One structured record emitted by the firewall
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub request_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_score: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl SecurityEvent {
    pub fn new(level: EventLevel, request_id: &str, message: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            request_id: request_id.to_string(),
            message: message.to_string(),
            client_ip: None,
            method: None,
            uri: None,
            rule_id: None,
            target: None,
            matched_value: None,
            score: None,
            total_score: None,
            reason: None,
            status_code: None,
        }
    }

    fn render_plain(&self) -> String {
        let mut line = format!(
            "{} [{}] request_id={} {}",
            self.timestamp.to_rfc3339(),
            match self.level {
                EventLevel::Debug => "DEBUG",
                EventLevel::Info => "INFO",
                EventLevel::Warn => "WARN",
                EventLevel::Error => "ERROR",
            },
            self.request_id,
            self.message
        );
        let mut push = |key: &str, value: &Option<String>| {
            if let Some(value) = value {
                line.push_str(&format!(" {key}={value}"));
            }
        };
        push("client_ip", &self.client_ip);
        push("method", &self.method);
        push("uri", &self.uri);
        push("rule_id", &self.rule_id);
        push("target", &self.target);
        push("matched_value", &self.matched_value);
        push("reason", &self.reason);
        if let Some(score) = self.score {
            line.push_str(&format!(" score={score}"));
        }
        if let Some(total) = self.total_score {
            line.push_str(&format!(" total_score={total}"));
        }
        if let Some(status) = self.status_code {
            line.push_str(&format!(" status={status}"));
        }
        line
    }
}

/// Producer half of the log pipeline.
///
/// `emit` never blocks the request path: a full queue drops the record and
/// bumps the drop counter.
#[derive(Debug, Clone)]
pub struct LogHandle {
    tx: mpsc::Sender<SecurityEvent>,
    min_level: EventLevel,
    dropped: Arc<AtomicU64>,
}

impl LogHandle {
    pub fn emit(&self, event: SecurityEvent) {
        if event.level < self.min_level {
            return;
        }
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!("waf_log_records_dropped", 1);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Spawn the single consumer task. The worker runs until the shutdown
/// signal flips (or every `LogHandle` clone is dropped), then drains the
/// queue and exits.
pub async fn spawn_log_worker(
    config: &LoggingConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(LogHandle, JoinHandle<()>)> {
    let (tx, mut rx) = mpsc::channel::<SecurityEvent>(config.queue_capacity.max(1));

    let mut file_sink = match &config.file_path {
        Some(path) => Some(
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| {
                    WafError::Config(format!("failed to open log file '{path}': {e}"))
                })?,
        ),
        None => None,
    };

    let json = config.json;
    let worker = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => write_record(&event, json, file_sink.as_mut()).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    // Drain whatever is queued, then exit
                    while let Ok(event) = rx.try_recv() {
                        write_record(&event, json, file_sink.as_mut()).await;
                    }
                    break;
                }
            }
        }
    });

    let handle = LogHandle {
        tx,
        min_level: EventLevel::parse(&config.severity),
        dropped: Arc::new(AtomicU64::new(0)),
    };

    Ok((handle, worker))
}

async fn write_record(event: &SecurityEvent, json: bool, file_sink: Option<&mut tokio::fs::File>) {
    let line = if json {
        match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize security event");
                return;
            }
        }
    } else {
        event.render_plain()
    };

    println!("{line}");

    if let Some(file) = file_sink {
        let mut buf = line.into_bytes();
        buf.push(b'\n');
        // Sink errors never reach the request path
        if let Err(e) = file.write_all(&buf).await {
            warn!(error = %e, "Failed to write security event to log file");
        } else if let Err(e) = file.flush().await {
            warn!(error = %e, "Failed to flush security event log file");
        }
    }
}
