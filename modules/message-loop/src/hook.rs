//! Interceptors that observe or veto delivery.

use std::rc::Rc;

use anyhow::Result;

use crate::handler::HandlerRef;
use crate::message::Message;

/// Intercepts messages bound for a handler.
///
/// Return `Ok(true)` to let delivery continue, `Ok(false)` to stop the rest
/// of the hook chain and suppress the handler. An `Err` is routed to the
/// exception handler and counts as `true`.
pub trait MessageHook {
    fn message_hook(&self, handler: &HandlerRef, msg: &dyn Message) -> Result<bool>;
}

impl<F> MessageHook for F
where
    F: Fn(&HandlerRef, &dyn Message) -> Result<bool>,
{
    fn message_hook(&self, handler: &HandlerRef, msg: &dyn Message) -> Result<bool> {
        self(handler, msg)
    }
}

/// Shared handle to a hook. Equality is allocation identity: install the same
/// `HookRef` twice and the second install is a no-op; an equal-looking but
/// separately allocated hook is a different hook.
pub type HookRef = Rc<dyn MessageHook>;

pub(crate) fn same_hook(a: &HookRef, b: &HookRef) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}
