//! Reference interpreter over the JSON machine DSL.
//!
//! Sessions hold exactly one active state. `start` enters the initial state;
//! `feed` takes the transition for `(state, event)` if one exists and ignores
//! the event otherwise. Exit actions run before transition actions, which run
//! before entry actions, and listeners see `on_exit` before `on_entry`.

use crate::definition::{Action, MachineDefinition, MachineDocument, State};
use crate::engine::{
    same_listener, Interpreter, Model, Session, SessionOptions, TransitionListener,
};
use crate::error::CoreError;
use crate::event::{Configuration, Event, SendOptions};
use crate::resolve::ResourceResolver;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Maximum include nesting below the root document.
pub const MAX_INCLUDE_DEPTH: usize = 8;

/// Compiles JSON machine documents into [`MachineDefinition`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatInterpreter;

impl FlatInterpreter {
    pub fn new() -> Self {
        Self
    }

    /// Parses the root document and merges every fragment it includes.
    async fn load_document(
        &self,
        document: &[u8],
        resolver: &dyn ResourceResolver,
    ) -> Result<MachineDocument, CoreError> {
        let mut root = MachineDocument::from_slice(document)?;
        let mut pending: VecDeque<(String, usize)> =
            root.include.iter().map(|r| (r.clone(), 1)).collect();
        let mut seen: HashSet<String> = HashSet::new();

        while let Some((reference, depth)) = pending.pop_front() {
            if !seen.insert(reference.clone()) {
                continue;
            }
            if depth > MAX_INCLUDE_DEPTH {
                return Err(CoreError::InvalidDefinition {
                    reason: format!("include depth exceeded at '{}'", reference),
                });
            }

            let bytes = resolver
                .fetch(&reference)
                .await
                .map_err(|source| CoreError::Resolve {
                    reference: reference.clone(),
                    source,
                })?;
            let fragment = MachineDocument::from_slice(&bytes)?;
            tracing::debug!("merged fragment '{}'", reference);

            for nested in root.merge(fragment) {
                pending.push_back((nested, depth + 1));
            }
        }

        Ok(root)
    }
}

#[async_trait]
impl Interpreter for FlatInterpreter {
    async fn compile(
        &self,
        name: &str,
        document: &[u8],
        resolver: &dyn ResourceResolver,
    ) -> Result<Arc<dyn Model>, CoreError> {
        let merged = self.load_document(document, resolver).await?;
        let definition = MachineDefinition::from_document(name, merged)?;
        Ok(Arc::new(definition))
    }
}

impl Model for MachineDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn checksum(&self) -> &str {
        &self.checksum
    }

    fn state_ids(&self) -> Vec<String> {
        self.document.states.clone()
    }

    fn instantiate(self: Arc<Self>, options: SessionOptions) -> Box<dyn Session> {
        Box::new(FlatSession {
            options,
            definition: self,
            current: None,
            listeners: Vec::new(),
        })
    }
}

/// A session of the reference interpreter.
pub struct FlatSession {
    options: SessionOptions,
    definition: Arc<MachineDefinition>,
    current: Option<State>,
    listeners: Vec<Arc<dyn TransitionListener>>,
}

impl FlatSession {
    fn enter(&self, state: &State) {
        self.run_actions(self.definition.entry_actions(state));
        for listener in &self.listeners {
            listener.on_entry(state.as_str());
        }
    }

    fn exit(&self, state: &State) {
        self.run_actions(self.definition.exit_actions(state));
        for listener in &self.listeners {
            listener.on_exit(state.as_str());
        }
    }

    fn run_actions(&self, actions: &[Action]) {
        for action in actions {
            match action {
                Action::Send(send) => {
                    let event = Event {
                        name: send.event.clone(),
                        event_type: send.event_type.clone(),
                        target: send.target.clone(),
                        origin: Some(self.options.session_id.clone()),
                        data: send.data.clone(),
                        delay: send.delay,
                        sendid: send.sendid.clone(),
                    };
                    let options = SendOptions::from_event(&event);
                    self.options.hook.on_send(event, options);
                }
                Action::Cancel { sendid } => self.options.hook.on_cancel(sendid),
            }
        }
    }

    fn configuration(&self) -> Configuration {
        self.current
            .iter()
            .map(|s| s.as_str().to_string())
            .collect()
    }
}

impl Session for FlatSession {
    fn id(&self) -> &str {
        &self.options.session_id
    }

    fn start(&mut self) -> Result<Configuration, CoreError> {
        if self.current.is_some() {
            tracing::debug!("session {} already started", self.options.session_id);
            return Ok(self.configuration());
        }

        let initial = self.definition.initial.clone();
        self.current = Some(initial.clone());
        self.enter(&initial);
        Ok(self.configuration())
    }

    fn feed(&mut self, event: &Event) -> Result<Configuration, CoreError> {
        let current = self.current.clone().ok_or_else(|| CoreError::NotStarted {
            session_id: self.options.session_id.clone(),
        })?;

        let Some((to, actions)) = self.definition.get_transition(&current, &event.name) else {
            tracing::debug!(
                "session {} ignored '{}' in state '{}'",
                self.options.session_id,
                event.name,
                current.as_str()
            );
            return Ok(self.configuration());
        };
        let to = to.clone();
        let actions = actions.to_vec();

        self.exit(&current);
        self.run_actions(&actions);
        self.current = Some(to.clone());
        self.enter(&to);

        Ok(self.configuration())
    }

    fn snapshot(&self) -> Configuration {
        self.configuration()
    }

    fn is_started(&self) -> bool {
        self.current.is_some()
    }

    fn add_listener(&mut self, listener: Arc<dyn TransitionListener>) {
        self.listeners.push(listener);
    }

    fn remove_listener(&mut self, listener: &Arc<dyn TransitionListener>) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| !same_listener(l, listener));
        self.listeners.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SendHook;
    use crate::resolve::{NoResolver, ResolveError};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingHook {
        sends: Mutex<Vec<(Event, SendOptions)>>,
        cancels: Mutex<Vec<String>>,
    }

    impl SendHook for RecordingHook {
        fn on_send(&self, event: Event, options: SendOptions) {
            self.sends.lock().push((event, options));
        }

        fn on_cancel(&self, sendid: &str) {
            self.cancels.lock().push(sendid.to_string());
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        log: Mutex<Vec<String>>,
    }

    impl TransitionListener for RecordingListener {
        fn on_entry(&self, state_id: &str) {
            self.log.lock().push(format!("enter:{}", state_id));
        }

        fn on_exit(&self, state_id: &str) {
            self.log.lock().push(format!("exit:{}", state_id));
        }
    }

    struct MapResolver(HashMap<String, Value>);

    #[async_trait]
    impl ResourceResolver for MapResolver {
        async fn fetch(&self, reference: &str) -> Result<Bytes, ResolveError> {
            self.0
                .get(reference)
                .map(|v| Bytes::from(serde_json::to_vec(v).unwrap()))
                .ok_or_else(|| ResolveError::NotFound(reference.to_string()))
        }
    }

    fn traffic_light() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "states": ["red", "green", "yellow"],
            "initial": "red",
            "transitions": [
                {"from": "red", "event": "timer", "to": "green"},
                {"from": "green", "event": "timer", "to": "yellow",
                 "actions": [{"send": {"event": "tick", "delay": 100, "sendid": "t1"}}]},
                {"from": "yellow", "event": "timer", "to": "red"}
            ],
            "on_entry": {"red": [{"cancel": {"sendid": "t1"}}]}
        }))
        .unwrap()
    }

    async fn compile(document: &[u8]) -> Arc<dyn Model> {
        FlatInterpreter::new()
            .compile("traffic-light", document, &NoResolver)
            .await
            .unwrap()
    }

    fn session(model: Arc<dyn Model>, hook: Arc<RecordingHook>) -> Box<dyn Session> {
        model.instantiate(SessionOptions {
            session_id: "traffic-light/abc".to_string(),
            hook,
        })
    }

    #[tokio::test]
    async fn test_start_enters_initial_state() {
        let model = compile(&traffic_light()).await;
        let hook = Arc::new(RecordingHook::default());
        let mut session = session(model, hook.clone());

        assert!(!session.is_started());
        let conf = session.start().unwrap();
        assert_eq!(conf.states(), ["red".to_string()]);
        assert_eq!(session.snapshot(), conf);
        assert_eq!(hook.cancels.lock().as_slice(), ["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_feed_before_start() {
        let model = compile(&traffic_light()).await;
        let mut session = session(model, Arc::new(RecordingHook::default()));

        let result = session.feed(&Event::new("timer"));
        assert!(matches!(result, Err(CoreError::NotStarted { .. })));
    }

    #[tokio::test]
    async fn test_listener_sees_exit_then_entry() {
        let model = compile(&traffic_light()).await;
        let mut session = session(model, Arc::new(RecordingHook::default()));
        let listener = Arc::new(RecordingListener::default());
        session.add_listener(listener.clone());

        session.start().unwrap();
        let conf = session.feed(&Event::new("timer")).unwrap();

        assert_eq!(conf.states(), ["green".to_string()]);
        assert_eq!(
            listener.log.lock().as_slice(),
            ["enter:red", "exit:red", "enter:green"]
        );
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let model = compile(&traffic_light()).await;
        let mut session = session(model, Arc::new(RecordingHook::default()));
        let listener = Arc::new(RecordingListener::default());
        let handle: Arc<dyn TransitionListener> = listener.clone();
        session.add_listener(handle.clone());

        assert!(session.remove_listener(&handle));
        assert!(!session.remove_listener(&handle));

        session.start().unwrap();
        assert!(listener.log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transition_actions_send_with_origin() {
        let model = compile(&traffic_light()).await;
        let hook = Arc::new(RecordingHook::default());
        let mut session = session(model, hook.clone());

        session.start().unwrap();
        session.feed(&Event::new("timer")).unwrap();
        session.feed(&Event::new("timer")).unwrap();

        let sends = hook.sends.lock();
        assert_eq!(sends.len(), 1);
        let (event, options) = &sends[0];
        assert_eq!(event.name, "tick");
        assert_eq!(event.origin.as_deref(), Some("traffic-light/abc"));
        assert_eq!(options.delay, std::time::Duration::from_millis(100));
        assert_eq!(options.sendid.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let model = compile(&traffic_light()).await;
        let mut session = session(model, Arc::new(RecordingHook::default()));

        session.start().unwrap();
        let conf = session.feed(&Event::new("nope")).unwrap();
        assert_eq!(conf.states(), ["red".to_string()]);
    }

    #[tokio::test]
    async fn test_start_twice_is_idempotent() {
        let model = compile(&traffic_light()).await;
        let hook = Arc::new(RecordingHook::default());
        let mut session = session(model, hook.clone());

        session.start().unwrap();
        session.feed(&Event::new("timer")).unwrap();
        let conf = session.start().unwrap();

        assert_eq!(conf.states(), ["green".to_string()]);
        assert_eq!(hook.cancels.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_compile_resolves_includes() {
        let root = serde_json::to_vec(&json!({
            "states": ["idle"],
            "initial": "idle",
            "include": ["fragments/run.json"]
        }))
        .unwrap();
        let resolver = MapResolver(HashMap::from([
            (
                "fragments/run.json".to_string(),
                json!({
                    "states": ["running"],
                    "transitions": [{"from": "idle", "event": "go", "to": "running"}],
                    "include": ["fragments/stop.json"]
                }),
            ),
            (
                "fragments/stop.json".to_string(),
                json!({
                    "transitions": [{"from": "running", "event": "stop", "to": "idle"}],
                    "include": ["fragments/run.json"]
                }),
            ),
        ]));

        let model = FlatInterpreter::new()
            .compile("worker", &root, &resolver)
            .await
            .unwrap();
        let mut state_ids = model.state_ids();
        state_ids.sort();
        assert_eq!(state_ids, vec!["idle".to_string(), "running".to_string()]);

        let mut session = model.instantiate(SessionOptions {
            session_id: "worker/1".to_string(),
            hook: Arc::new(RecordingHook::default()),
        });
        session.start().unwrap();
        assert_eq!(
            session.feed(&Event::new("go")).unwrap().states(),
            ["running".to_string()]
        );
        assert_eq!(
            session.feed(&Event::new("stop")).unwrap().states(),
            ["idle".to_string()]
        );
    }

    #[tokio::test]
    async fn test_compile_missing_include() {
        let root = serde_json::to_vec(&json!({
            "states": ["idle"],
            "initial": "idle",
            "include": ["missing.json"]
        }))
        .unwrap();

        let result = FlatInterpreter::new().compile("x", &root, &NoResolver).await;
        match result {
            Err(CoreError::Resolve { reference, source }) => {
                assert_eq!(reference, "missing.json");
                assert_eq!(source, ResolveError::NotFound("missing.json".to_string()));
            }
            other => panic!(
                "expected resolve error, got {:?}",
                other.map(|m| m.name().to_string())
            ),
        }
    }

    #[tokio::test]
    async fn test_compile_rejects_malformed_json() {
        let result = FlatInterpreter::new()
            .compile("x", b"{not json", &NoResolver)
            .await;
        assert!(matches!(result, Err(ref e) if e.is_compile_error()));
    }

    fn run_sequence(model: &Arc<dyn Model>, events: &[&str]) -> Vec<Configuration> {
        let mut session = model.clone().instantiate(SessionOptions {
            session_id: "traffic-light/p".to_string(),
            hook: Arc::new(RecordingHook::default()),
        });
        let mut out = vec![session.start().unwrap()];
        for name in events {
            out.push(session.feed(&Event::new(*name)).unwrap());
        }
        out
    }

    proptest! {
        #[test]
        fn prop_independent_sessions_are_deterministic(
            events in proptest::collection::vec(
                prop_oneof![Just("timer"), Just("noise"), Just("reset")],
                0..32,
            )
        ) {
            let model = Arc::new(
                MachineDefinition::from_document(
                    "traffic-light",
                    MachineDocument::from_slice(&traffic_light()).unwrap(),
                )
                .unwrap(),
            ) as Arc<dyn Model>;

            let first = run_sequence(&model, &events);
            let second = run_sequence(&model, &events);
            prop_assert_eq!(first, second);
        }
    }
}
