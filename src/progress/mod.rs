//! Real-time progress streaming.
//!
//! [`ProgressHub`] keeps an ordered, replayable event log per session and
//! pushes new events to any number of subscribers. Phase workers publish
//! through a [`ProgressSink`] bound to their session.

mod event;
mod hub;

pub use event::{EventType, ProgressEvent, ProgressSession};
pub use hub::{HubConfig, ProgressHub, Subscription};

use std::sync::Arc;

use serde_json::{Value, json};

use crate::phase::Phase;

/// Publisher handle scoped to one session and phase.
#[derive(Clone)]
pub struct ProgressSink {
    hub: Arc<ProgressHub>,
    session_id: String,
    phase: Phase,
}

impl ProgressSink {
    pub fn new(hub: Arc<ProgressHub>, session_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            hub,
            session_id: session_id.into(),
            phase,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Publish a `progress` event tagged with the phase and a stage name.
    pub fn progress(&self, stage: &str, message: impl Into<String>, extra: Value) {
        let mut data = json!({
            "phase": self.phase,
            "stage": stage,
            "message": message.into(),
        });
        if let (Some(obj), Value::Object(extra)) = (data.as_object_mut(), extra) {
            obj.extend(extra);
        }
        self.hub.publish(&self.session_id, EventType::Progress, data);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.hub.publish(
            &self.session_id,
            EventType::Error,
            json!({"phase": self.phase, "message": message.into()}),
        );
    }
}
