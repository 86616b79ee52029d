//! Event Publisher Adapter
//!
//! Implements the `EventPublisher` port with various backends.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::events::PipelineEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Logging-based event publisher.
///
/// Publishes pipeline events to the tracing/logging system.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    /// Whether to log events at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a publisher that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    /// Create a publisher that logs at debug level.
    pub fn debug_level() -> Self {
        Self { info_level: false }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        let event_type = event.event_type();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        match &event {
            PipelineEvent::StageFailed { .. } | PipelineEvent::ResourceLeaked { .. } => {
                warn!(event_type = %event_type, event = %json, "{}", event.describe());
            }
            _ if self.info_level => {
                info!(event_type = %event_type, event = %json, "{}", event.describe());
            }
            _ => {
                debug!(event_type = %event_type, event = %json, "{}", event.describe());
            }
        }

        Ok(())
    }
}

/// Plain-text, append-only run log: one timestamped line per event.
#[derive(Debug)]
pub struct RunLogPublisher {
    path: PathBuf,
    // Serializes appends from the concurrent job tasks
    lock: Mutex<()>,
}

impl RunLogPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn format_line(event: &PipelineEvent) -> String {
        format!(
            "{} {:<18} {}\n",
            event.timestamp().format("%Y-%m-%d %H:%M:%S%.3f"),
            event.event_type(),
            event.describe()
        )
    }
}

#[async_trait]
impl EventPublisher for RunLogPublisher {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        let line = Self::format_line(&event);
        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-memory event collector for testing.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<PipelineEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events.
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Get events of a specific type.
    pub fn events_of_type(&self, event_type: &str) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// `describe()` lines, in publication order.
    pub fn lines(&self) -> Vec<String> {
        self.events.read().iter().map(|e| e.describe()).collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<PipelineEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}

/// Composite event publisher that publishes to multiple backends.
///
/// A failing backend is logged and does not stop the others.
#[derive(Default)]
pub struct CompositeEventPublisher {
    publishers: Vec<Box<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a publisher to the composite.
    pub fn with_publisher<P: EventPublisher + 'static>(mut self, publisher: P) -> Self {
        self.publishers.push(Box::new(publisher));
        self
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("publisher_count", &self.publishers.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(event.clone()).await {
                warn!("Event publisher failed for {}: {}", event.event_type(), e);
            }
        }
        Ok(())
    }
}

/// Shared publisher handle usable where an owned publisher is expected.
#[async_trait]
impl<P: EventPublisher + ?Sized> EventPublisher for std::sync::Arc<P> {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        (**self).publish(event).await
    }
}
