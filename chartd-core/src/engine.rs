//! The interpreter contract.
//!
//! chartd does not execute statechart semantics itself. It drives an
//! interpreter through the traits below: compile a document into a
//! [`Model`], instantiate a [`Session`], then start, feed and snapshot it.
//! The session calls back into a [`SendHook`] whenever the machine sends or
//! cancels an external event, and notifies [`TransitionListener`]s as states
//! are entered and exited.

use crate::error::CoreError;
use crate::event::{Configuration, Event, SendOptions};
use crate::resolve::ResourceResolver;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Observer of state entry and exit.
pub trait TransitionListener: Send + Sync {
    fn on_entry(&self, state_id: &str);
    fn on_exit(&self, state_id: &str);
}

/// External-communication callbacks a session invokes during a step.
///
/// Implementations must return promptly: the session's step is synchronous
/// and must not wait on I/O.
pub trait SendHook: Send + Sync {
    fn on_send(&self, event: Event, options: SendOptions);
    fn on_cancel(&self, sendid: &str);
}

/// Parameters for a new session.
#[derive(Clone)]
pub struct SessionOptions {
    pub session_id: String,
    pub hook: Arc<dyn SendHook>,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// One running execution of a model.
pub trait Session: Send {
    /// Session identifier.
    fn id(&self) -> &str;

    /// Runs the initial transition.
    fn start(&mut self) -> Result<Configuration, CoreError>;

    /// Processes one event to completion.
    fn feed(&mut self, event: &Event) -> Result<Configuration, CoreError>;

    /// Returns the current configuration without side effects.
    fn snapshot(&self) -> Configuration;

    /// Returns true once `start` has run.
    fn is_started(&self) -> bool;

    fn add_listener(&mut self, listener: Arc<dyn TransitionListener>);

    /// Removes a listener previously added. Returns false if it was not registered.
    fn remove_listener(&mut self, listener: &Arc<dyn TransitionListener>) -> bool;
}

/// An immutable compiled machine.
pub trait Model: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Integrity checksum of the compiled document.
    fn checksum(&self) -> &str;

    /// All states declared by the model.
    fn state_ids(&self) -> Vec<String>;

    /// Creates a fresh, unstarted session bound to this model.
    fn instantiate(self: Arc<Self>, options: SessionOptions) -> Box<dyn Session>;
}

/// Compiles documents into models.
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn compile(
        &self,
        name: &str,
        document: &[u8],
        resolver: &dyn ResourceResolver,
    ) -> Result<Arc<dyn Model>, CoreError>;
}

/// Compares two listener handles by identity.
pub fn same_listener(a: &Arc<dyn TransitionListener>, b: &Arc<dyn TransitionListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
