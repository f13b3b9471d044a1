//! Application layer - runtime state shared by SIP handlers and the agent watcher

pub mod runtime;

pub use runtime::{CallPhase, CallSession, NetworkIdentity, RuntimeOptions, RuntimeState};
