//! # chartd-core
//!
//! Interpreter contract for chartd.
//!
//! This crate provides:
//! - The traits the service drives an interpreter through
//! - Event envelopes and configurations
//! - The resource-resolution hook used at compile time
//! - A reference flat interpreter over a JSON machine DSL

pub mod definition;
pub mod engine;
pub mod error;
pub mod event;
pub mod machine;
pub mod resolve;

pub use definition::{Action, MachineDefinition, MachineDocument, SendAction, State, Transition};
pub use engine::{Interpreter, Model, SendHook, Session, SessionOptions, TransitionListener};
pub use error::CoreError;
pub use event::{Configuration, Event, SendOptions, START_EVENT};
pub use machine::{FlatInterpreter, FlatSession};
pub use resolve::{NoResolver, ResolveError, ResourceResolver};
