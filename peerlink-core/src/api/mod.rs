//! Client API
//!
//! [`Messenger`] is the embedding surface: UIs construct one, register an
//! event handler, and drive it by calling operations plus a periodic
//! [`Messenger::poll`]. Everything underneath (transports, sessions, crypto)
//! stays internal to the engine.

pub mod config;
pub mod error;
pub mod events;
pub mod messenger;

pub use config::{ClientConfig, DEFAULT_P2P_PORT};
pub use error::{ClientError, ClientResult};
pub use events::{CallbackHandler, ClientEvent, EventDispatcher, EventHandler, MessageContent};
pub use messenger::Messenger;
