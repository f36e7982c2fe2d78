//! Core module - Lifecycle engine, container runtime access and diagnostics

mod bundle;
mod container;
mod diagnostics;
mod error;
mod lifecycle;
mod logbuffer;
mod monitor;
mod orchestrator;
mod process;
mod provision;
mod readiness;
mod recovery;
mod requirements;
pub mod resource;
mod runtime;
pub mod settings;
mod shared;
mod status;

#[cfg(test)]
mod testing;

pub use diagnostics::ExportFormat;
pub use lifecycle::LifecycleState;
pub use logbuffer::LogBuffer;
pub use orchestrator::{EngineComponents, Orchestrator, UpdateOutcome};
pub use settings::AppConfiguration;
