//! Message values dispatched by the loop.

use std::any::Any;
use std::fmt;

/// Object-safe bridge to [`Any`] so `dyn Message` can be downcast.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A typed unit of dispatch.
///
/// Messages are immutable once handed to the loop, with one exception: an
/// already-queued conflatable message may absorb a newer one through
/// [`Message::conflate`].
pub trait Message: AsAny {
    /// The type string. Conflation only pairs messages with equal types.
    fn msg_type(&self) -> &str;

    /// Whether this message may take part in conflation.
    fn is_conflatable(&self) -> bool {
        false
    }

    /// Merge `other` into this (already-queued) message.
    ///
    /// Returns `true` when `other` was fully absorbed and must not be queued.
    /// Only called when both messages report `is_conflatable()` and share a
    /// `msg_type()`. A panic here is caught: this message stays queued and
    /// `other` is queued after it.
    fn conflate(&mut self, _other: &dyn Message) -> bool {
        false
    }
}

impl<'a> dyn Message + 'a {
    /// Recover the concrete message type.
    pub fn downcast_ref<T: Message + Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: Message + Any>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

impl fmt::Debug for dyn Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("msg_type", &self.msg_type())
            .field("conflatable", &self.is_conflatable())
            .finish()
    }
}

/// A plain message identified only by its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicMessage {
    msg_type: String,
}

impl BasicMessage {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
        }
    }
}

impl Message for BasicMessage {
    fn msg_type(&self) -> &str {
        &self.msg_type
    }
}

/// A message that de-duplicates itself while queued.
///
/// Any number of posts to the same handler collapse into the first one still
/// waiting in the queue. Typical use: "update-request", "fit-request".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflatableMessage {
    msg_type: String,
}

impl ConflatableMessage {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
        }
    }
}

impl Message for ConflatableMessage {
    fn msg_type(&self) -> &str {
        &self.msg_type
    }

    fn is_conflatable(&self) -> bool {
        true
    }

    fn conflate(&mut self, _other: &dyn Message) -> bool {
        true
    }
}
