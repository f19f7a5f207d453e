//! Machine definition types for the reference interpreter.
//!
//! Machine definitions use a JSON DSL:
//!
//! ```json
//! {
//!   "states": ["red", "green", "yellow"],
//!   "initial": "red",
//!   "transitions": [
//!     {"from": "red", "event": "timer", "to": "green"},
//!     {"from": "green", "event": "timer", "to": "yellow",
//!      "actions": [{"send": {"event": "tick", "delay": 100, "sendid": "t1"}}]},
//!     {"from": ["yellow", "green"], "event": "reset", "to": "red"}
//!   ],
//!   "on_entry": {"red": [{"cancel": {"sendid": "t1"}}]},
//!   "include": ["fragments/maintenance.json"]
//! }
//! ```
//!
//! Documents listed under `include` are fragments with the same shape
//! (without `initial`) and are merged into the including document.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// A state in the machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(pub String);

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for State {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for State {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An outbound send performed as executable content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendAction {
    /// Name of the event to send.
    pub event: String,

    /// Event I/O processor.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default)]
    pub data: Value,

    /// Delay in milliseconds.
    #[serde(default)]
    pub delay: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sendid: Option<String>,
}

/// Executable content run on entry, exit, or while taking a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Send(SendAction),
    Cancel { sendid: String },
}

/// A transition in the machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// Source state(s). Can be a single state or multiple.
    #[serde(deserialize_with = "deserialize_from_states")]
    pub from: Vec<State>,

    /// Event that triggers this transition.
    pub event: String,

    /// Target state.
    pub to: State,

    /// Executable content run between exit and entry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

fn deserialize_from_states<'de, D>(deserializer: D) -> Result<Vec<State>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct FromStatesVisitor;

    impl<'de> Visitor<'de> for FromStatesVisitor {
        type Value = Vec<State>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![State(v.to_string())])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut states = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                states.push(State(s));
            }
            Ok(states)
        }
    }

    deserializer.deserialize_any(FromStatesVisitor)
}

/// Raw machine document as transmitted, before includes are merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineDocument {
    /// All valid states.
    #[serde(default)]
    pub states: Vec<String>,

    /// Initial state. Required on the root document, absent on fragments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    #[serde(default)]
    pub transitions: Vec<Transition>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub on_entry: BTreeMap<String, Vec<Action>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub on_exit: BTreeMap<String, Vec<Action>>,

    /// References to fragments merged into this document.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    /// Optional metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl MachineDocument {
    /// Parses a document from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Merges a fragment into this document. The fragment's own includes are
    /// returned to the caller rather than merged.
    pub fn merge(&mut self, fragment: MachineDocument) -> Vec<String> {
        if fragment.initial.is_some() {
            tracing::debug!("ignoring 'initial' declared by an included fragment");
        }
        for state in fragment.states {
            if !self.states.contains(&state) {
                self.states.push(state);
            }
        }
        self.transitions.extend(fragment.transitions);
        for (state, actions) in fragment.on_entry {
            self.on_entry.entry(state).or_default().extend(actions);
        }
        for (state, actions) in fragment.on_exit {
            self.on_exit.entry(state).or_default().extend(actions);
        }
        fragment.include
    }
}

/// Validated and indexed machine definition.
#[derive(Debug, Clone)]
pub struct MachineDefinition {
    /// Machine name.
    pub name: String,

    /// All valid states.
    pub states: HashSet<State>,

    /// Initial state for new sessions.
    pub initial: State,

    /// Transitions indexed by (from_state, event) -> (to_state, actions).
    transitions: HashMap<(State, String), (State, Vec<Action>)>,

    on_entry: HashMap<State, Vec<Action>>,

    on_exit: HashMap<State, Vec<Action>>,

    /// Merged document for inspection.
    pub document: MachineDocument,

    /// Hash of the definition for integrity checks.
    pub checksum: String,
}

impl MachineDefinition {
    /// Parses and validates a machine definition from JSON.
    pub fn from_json(name: impl Into<String>, json: &Value) -> Result<Self, CoreError> {
        let document: MachineDocument = serde_json::from_value(json.clone())?;
        Self::from_document(name, document)
    }

    /// Validates a fully merged document.
    pub fn from_document(
        name: impl Into<String>,
        document: MachineDocument,
    ) -> Result<Self, CoreError> {
        let name = name.into();

        // Build state set
        let states: HashSet<State> = document.states.iter().map(|s| State(s.clone())).collect();
        if states.is_empty() {
            return Err(CoreError::InvalidDefinition {
                reason: "machine declares no states".to_string(),
            });
        }

        // Validate initial state
        let initial = match &document.initial {
            Some(initial) => State(initial.clone()),
            None => {
                return Err(CoreError::InvalidDefinition {
                    reason: "missing initial state".to_string(),
                })
            }
        };
        if !states.contains(&initial) {
            return Err(CoreError::InvalidDefinition {
                reason: format!("initial state '{}' not in states list", initial.as_str()),
            });
        }

        // Build and validate transitions
        let mut transitions = HashMap::new();
        for t in &document.transitions {
            if !states.contains(&t.to) {
                return Err(CoreError::InvalidDefinition {
                    reason: format!("transition target '{}' not in states list", t.to.as_str()),
                });
            }

            for from in &t.from {
                if !states.contains(from) {
                    return Err(CoreError::InvalidDefinition {
                        reason: format!("transition source '{}' not in states list", from.as_str()),
                    });
                }

                let key = (from.clone(), t.event.clone());
                if transitions.contains_key(&key) {
                    return Err(CoreError::InvalidDefinition {
                        reason: format!(
                            "duplicate transition from '{}' on event '{}'",
                            from.as_str(),
                            t.event
                        ),
                    });
                }

                transitions.insert(key, (t.to.clone(), t.actions.clone()));
            }
        }

        let on_entry = index_actions(&states, &document.on_entry, "on_entry")?;
        let on_exit = index_actions(&states, &document.on_exit, "on_exit")?;

        // Compute checksum
        let json_bytes = serde_json::to_vec(&document)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        Ok(Self {
            name,
            states,
            initial,
            transitions,
            on_entry,
            on_exit,
            document,
            checksum,
        })
    }

    /// Looks up a transition for the given state and event.
    pub fn get_transition(&self, state: &State, event: &str) -> Option<(&State, &[Action])> {
        self.transitions
            .get(&(state.clone(), event.to_string()))
            .map(|(to, actions)| (to, actions.as_slice()))
    }

    /// Returns the entry actions of a state.
    pub fn entry_actions(&self, state: &State) -> &[Action] {
        self.on_entry.get(state).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns the exit actions of a state.
    pub fn exit_actions(&self, state: &State) -> &[Action] {
        self.on_exit.get(state).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns true if the given state is valid for this machine.
    pub fn has_state(&self, state: &State) -> bool {
        self.states.contains(state)
    }

    /// Returns all valid events from the given state.
    pub fn events_from(&self, state: &State) -> Vec<&str> {
        self.transitions
            .keys()
            .filter(|(s, _)| s == state)
            .map(|(_, e)| e.as_str())
            .collect()
    }
}

fn index_actions(
    states: &HashSet<State>,
    actions: &BTreeMap<String, Vec<Action>>,
    section: &str,
) -> Result<HashMap<State, Vec<Action>>, CoreError> {
    let mut indexed = HashMap::with_capacity(actions.len());
    for (state, list) in actions {
        let state = State(state.clone());
        if !states.contains(&state) {
            return Err(CoreError::InvalidDefinition {
                reason: format!("{} refers to unknown state '{}'", section, state.as_str()),
            });
        }
        indexed.insert(state, list.clone());
    }
    Ok(indexed)
}
