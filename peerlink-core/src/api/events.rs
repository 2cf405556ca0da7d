//! Client Events
//!
//! The engine talks back to its embedder through events: responses arrive
//! asynchronously over the relay stream, so operations return immediately
//! and their outcomes surface here. Handlers must be `Send + Sync`; UIs
//! typically forward events into their own channel.

use std::sync::Arc;

use crate::network::{FriendInfo, ResponseAction, WireMode};
use crate::session::ChatMode;

/// Decrypted message content, reconstructed from the payload kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    File { filename: String, data: Vec<u8> },
    Image(Vec<u8>),
}

/// Everything the engine reports to its embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    RegistrationCompleted { message: String },
    RegistrationFailed { message: String },
    LoginCompleted { username: String },
    LoginFailed { message: String },
    LoggedOut,
    VerificationCodeRequested { message: String },

    FriendsListed { friends: Vec<FriendInfo> },
    FriendStatusChanged { friend: FriendInfo },
    FriendRemoved { username: String },

    MessageReceived {
        from: String,
        content: MessageContent,
        timestamp: u64,
        /// Mode the session was in when the message was handed out.
        mode: ChatMode,
    },
    /// A message arrived but could not be decrypted with the current key.
    /// The message is gone; the session itself is untouched.
    MessageUndecryptable { from: String, reason: String },

    /// A session key is now installed for this peer.
    SessionEstablished { peer: String },
    /// The session key was destroyed (peer offline, unfriended, logout).
    SessionEnded { peer: String },

    ModeChanged { peer: String, mode: ChatMode },
    /// The peer asks to switch modes; answer with
    /// [`respond_to_mode_change`](super::Messenger::respond_to_mode_change).
    ModeChangeRequested {
        from: String,
        requested_mode: WireMode,
        request_id: String,
    },

    /// A structured error response from the relay.
    ServerError {
        action: ResponseAction,
        message: String,
        /// Remote identity the error refers to, when it names one.
        user: Option<String>,
    },
    /// A frame was received but could not be processed.
    Error { message: String },
    /// The relay stream is gone; the engine needs a reconnect.
    Disconnected { reason: String },
}

/// Receives engine events. Implementations must not block: events are
/// dispatched inline from `poll`.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &ClientEvent);
}

/// Wraps a closure as an [`EventHandler`].
pub struct CallbackHandler<F>
where
    F: Fn(&ClientEvent) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackHandler<F>
where
    F: Fn(&ClientEvent) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        CallbackHandler { callback }
    }
}

impl<F> EventHandler for CallbackHandler<F>
where
    F: Fn(&ClientEvent) + Send + Sync,
{
    fn on_event(&self, event: &ClientEvent) {
        (self.callback)(event)
    }
}

/// Fans events out to every registered handler.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn clear_handlers(&mut self) {
        self.handlers.clear();
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn dispatch(&self, event: ClientEvent) {
        for handler in &self.handlers {
            handler.on_event(&event);
        }
    }
}
