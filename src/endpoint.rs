//! Delivery endpoints: the handles collaborators post work through.
//!
//! An [`Endpoint`] is bound to one [`Dispatcher`] for its whole life and
//! forwards to that dispatcher's scheduler. It can also carry [`Message`]s;
//! a message is delivered by a task like any other post and is offered to
//! the endpoint's callback first, then to its default handler.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::scheduler::Runnable;

/// An envelope with a code, two integer arguments and an opaque payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub what: i32,
    pub arg1: i64,
    pub arg2: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Message {
    #[must_use]
    pub fn new(what: i32) -> Self {
        Self {
            what,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_args(mut self, arg1: i64, arg2: i64) -> Self {
        self.arg1 = arg1;
        self.arg2 = arg2;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Returns `true` when the message was consumed.
pub type MessageCallback = Arc<dyn Fn(&Message) -> bool + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Handle for posting work and messages into one dispatcher.
#[derive(Clone)]
pub struct Endpoint {
    dispatcher: Arc<Dispatcher>,
    callback: Option<MessageCallback>,
    handler: Option<MessageHandler>,
}

impl Endpoint {
    #[must_use]
    pub const fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            callback: None,
            handler: None,
        }
    }

    /// Create an endpoint whose messages go to `callback` first.
    #[must_use]
    pub fn with_callback(
        dispatcher: Arc<Dispatcher>,
        callback: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            dispatcher,
            callback: Some(Arc::new(callback)),
            handler: None,
        }
    }

    /// Set the handler for messages the callback does not consume.
    #[must_use]
    pub fn with_handler(mut self, handler: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn post(&self, work: Runnable) -> bool {
        self.dispatcher.post(work)
    }

    pub fn post_delayed(&self, work: Runnable, delay_ms: i64) -> Result<bool> {
        self.dispatcher.post_delayed(work, delay_ms)
    }

    pub fn post_at_front_of_queue(&self, work: Runnable) -> bool {
        self.dispatcher.post_at_front_of_queue(work)
    }

    /// Cancel every pending post of `work`.
    pub fn remove_callbacks(&self, work: &Runnable) {
        self.dispatcher.scheduler().remove(work);
    }

    pub fn send_message(&self, message: Message) -> bool {
        self.post(self.delivery(message))
    }

    pub fn send_message_delayed(&self, message: Message, delay_ms: i64) -> Result<bool> {
        self.post_delayed(self.delivery(message), delay_ms)
    }

    pub fn send_message_at_front_of_queue(&self, message: Message) -> bool {
        self.post_at_front_of_queue(self.delivery(message))
    }

    pub fn send_empty_message(&self, what: i32) -> bool {
        self.send_message(Message::new(what))
    }

    /// Deliver `message` now, on the calling thread.
    pub fn dispatch_message(&self, message: &Message) {
        if let Some(callback) = &self.callback {
            if callback(message) {
                return;
            }
        }
        match &self.handler {
            Some(handler) => handler(message),
            None => tracing::debug!(
                event = "endpoint.message.unhandled",
                what = message.what,
                "Message had no handler"
            ),
        }
    }

    fn delivery(&self, message: Message) -> Runnable {
        let endpoint = self.clone();
        tracing::trace!(
            event = "endpoint.message.send",
            what = message.what,
            "Message queued for delivery"
        );
        Runnable::new(move || endpoint.dispatch_message(&message))
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("dispatcher", &self.dispatcher.bound_thread())
            .field("callback", &self.callback.is_some())
            .field("handler", &self.handler.is_some())
            .finish()
    }
}
