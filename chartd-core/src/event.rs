//! Event envelopes and active-state configurations.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Event name that starts an instance when delivered like any other event.
pub const START_EVENT: &str = "system.start";

/// The unit exchanged with sessions and across the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name.
    pub name: String,

    /// Event I/O processor identifier.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    /// Destination; absent means the sending session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Identifier of the sending session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// Opaque payload.
    #[serde(default)]
    pub data: Value,

    /// Delivery delay in milliseconds.
    #[serde(default)]
    pub delay: u64,

    /// Correlation key for cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sendid: Option<String>,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_type: None,
            target: None,
            origin: None,
            data: Value::Null,
            delay: 0,
            sendid: None,
        }
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = delay_ms;
        self
    }

    pub fn with_sendid(mut self, sendid: impl Into<String>) -> Self {
        self.sendid = Some(sendid.into());
        self
    }

    /// Returns true if this is the distinguished start alias.
    pub fn is_start(&self) -> bool {
        self.name == START_EVENT
    }
}

/// Scheduling options accompanying an outbound send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub delay: Duration,
    pub sendid: Option<String>,
}

impl SendOptions {
    /// Derives options from the envelope's `delay` and `sendid` fields.
    pub fn from_event(event: &Event) -> Self {
        Self {
            delay: Duration::from_millis(event.delay),
            sendid: event.sendid.clone(),
        }
    }
}

/// The set of currently active states of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(Vec<String>);

impl Configuration {
    pub fn new(states: Vec<String>) -> Self {
        Self(states)
    }

    pub fn states(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, state: &str) -> bool {
        self.0.iter().any(|s| s == state)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Configuration {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_defaults() {
        let event: Event = serde_json::from_value(json!({"name": "timer"})).unwrap();
        assert_eq!(event.name, "timer");
        assert_eq!(event.event_type, None);
        assert_eq!(event.target, None);
        assert_eq!(event.data, Value::Null);
        assert_eq!(event.delay, 0);
        assert_eq!(event.sendid, None);
    }

    #[test]
    fn test_envelope_wire_names() {
        let event = Event::new("tick")
            .with_type("scxml")
            .with_origin("light/abc")
            .with_delay(100)
            .with_sendid("t1");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "scxml");
        assert_eq!(value["origin"], "light/abc");
        assert_eq!(value["delay"], 100);
        assert_eq!(value["sendid"], "t1");
        assert!(value.get("target").is_none());
    }

    #[test]
    fn test_send_options_from_event() {
        let event = Event::new("tick").with_delay(250).with_sendid("s1");
        let options = SendOptions::from_event(&event);
        assert_eq!(options.delay, Duration::from_millis(250));
        assert_eq!(options.sendid.as_deref(), Some("s1"));
    }

    #[test]
    fn test_configuration_serializes_as_list() {
        let conf: Configuration = ["red"].into_iter().collect();
        assert_eq!(serde_json::to_value(&conf).unwrap(), json!(["red"]));
        assert!(conf.contains("red"));
        assert!(!conf.contains("green"));
    }

    #[test]
    fn test_start_alias() {
        assert!(Event::new(START_EVENT).is_start());
        assert!(!Event::new("timer").is_start());
    }
}
