//! Observability sink for non-fatal conditions.
//!
//! Classification never fails on an unfamiliar media type; it reports one
//! here instead. The sink is passed in by the caller so tests can inspect
//! exactly which warnings were raised.

use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::digest::OciDigest;
use crate::media_type::MediaType;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A manifest carried a media type outside the recognized set.
    UnexpectedMediaType {
        operation: &'static str,
        digest: OciDigest,
        media_type: MediaType,
    },
    /// The source sent no content type from the recognized set.
    MissingContentType { reference: String },
    /// An index child of unknown kind was copied as an opaque blob.
    OpaqueChild { parent: OciDigest, child: OciDigest },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Default sink: forwards every event to `tracing` at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match event {
            Event::UnexpectedMediaType {
                operation,
                digest,
                media_type,
            } => warn!(%digest, %media_type, "Unexpected media type for {}()", operation),
            Event::MissingContentType { reference } => {
                warn!(%reference, "Registry sent no recognizable manifest content type")
            }
            Event::OpaqueChild { parent, child } => {
                warn!(%parent, %child, "Copying index child of unknown kind as an opaque blob")
            }
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
