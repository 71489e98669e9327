//! Commands exposed to a UI shell.
//!
//! Each command takes the shared `AppState` and returns serializable
//! results; progress of a running turn is pushed through a `UiSink`.

pub mod chat;
pub mod conversation;
