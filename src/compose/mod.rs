//! Compose project orchestration
//!
//! A project is a set of named instances declared in one or more compose
//! files. This module loads and validates them, orders them by their
//! dependencies and drives each instance through build, create and stop.

pub mod config;
pub mod graph;
pub mod instance;
pub mod orchestrator;
pub mod parser;
pub mod schema;
pub mod settings;

pub use config::{ProjectConfig, ServiceSpec};
pub use graph::{DependencyGraph, DependencyPolicy};
pub use instance::{
    BuildOutcome, CreateOptions, CreateOutcome, InstanceController, InstancePhase, InstanceRecord,
    LogStream,
};
pub use orchestrator::{CreateAction, ProjectOrchestrator, UpOptions};
pub use parser::ComposeParser;
pub use schema::{SchemaValidator, SchemaViolation};
pub use settings::ProjectSettings;
