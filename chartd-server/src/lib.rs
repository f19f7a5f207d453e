//! # chartd-server
//!
//! Statechart orchestration service for chartd.
//!
//! This crate provides:
//! - Definition registry fed from documents, archives, storage or URLs
//! - Instance registry with per-instance sessions
//! - Event routing with delayed and cancelable sends
//! - Transition notifications for subscribers
//! - HTTP API with Server-Sent Events change streams

pub mod api;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod instances;
pub mod metrics;
pub mod models;
pub mod router;
pub mod server;
pub mod service;

pub use api::Api;
pub use broadcast::{Notification, NotificationReceiver, SubscriptionManager};
pub use config::{
    BackendKind, Config, ConfigError, MetricsConfig, NetworkConfig, RoutingConfig, StorageConfig,
};
pub use error::{ErrorKind, ServiceError};
pub use instances::{Instance, InstanceRegistry};
pub use metrics::Metrics;
pub use models::{DefinitionInfo, ModelRegistry, ModelSource};
pub use router::{CancelOutcome, EventRouter, HttpTransport, LocalDelivery, Route, Transport};
pub use server::{Server, ServerConfig};
pub use service::{Service, ServiceBuilder};
