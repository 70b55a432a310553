//! Messaging channel adapters.

pub mod messenger;

pub use messenger::{MessengerChannel, MessengerState, messenger_routes};
