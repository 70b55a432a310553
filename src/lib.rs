//! botbridge — Messenger ↔ NLU webhook bridge.

pub mod channels;
pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod nlu;
pub mod pipeline;
pub mod reply;
pub mod store;
