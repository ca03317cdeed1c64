//! Workload lifecycle core for the berth control plane.
//!
//! One uniform state machine supervises every hosted workload kind: game
//! servers, managed VM instances behind a hypervisor CLI, and interpreted
//! bot processes. Transport and persistence are collaborators behind
//! interfaces; everything in here is transport-agnostic.

pub mod bot;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod game;
pub mod hypervisor;
pub mod image;
pub mod log_ring;
pub mod orchestrator;
pub mod port_alloc;
pub mod runtime;
pub mod store;
pub mod supervisor;
mod support;
pub mod vm;

pub use config::AgentConfig;
pub use error::LifecycleError;
pub use events::{Bus, Event};
pub use orchestrator::{CreateRequest, Orchestrator};
pub use store::{DirStore, MemoryStore, MutableField, Store};
