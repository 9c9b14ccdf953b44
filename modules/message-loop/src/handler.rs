//! The consumer side of dispatch.

use std::fmt;
use std::rc::Rc;

use anyhow::Result;

use crate::message::Message;

/// Something that processes messages.
///
/// An `Err` is routed to the loop's exception handler; it never reaches the
/// producer that sent or posted the message.
pub trait MessageHandler {
    fn process_message(&self, msg: &dyn Message) -> Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&dyn Message) -> Result<()>,
{
    fn process_message(&self, msg: &dyn Message) -> Result<()> {
        self(msg)
    }
}

/// Shared handle to a handler. The loop only keeps these while a message
/// for the handler is queued.
pub type HandlerRef = Rc<dyn MessageHandler>;

/// Opaque identity of a handler, derived from its allocation.
///
/// The hook registry is keyed by `HandlerId` and never owns the handler.
/// Owners must call `MessageLoop::clear_data` before dropping a handler that
/// has hooks installed; otherwise a later allocation at the same address
/// would inherit them.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

impl HandlerId {
    pub fn of(handler: &HandlerRef) -> Self {
        Self(Rc::as_ptr(handler) as *const () as usize)
    }
}

impl fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerId({:#x})", self.0)
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
