//! Faults raised by hooks and handlers, and the exception handler they are
//! routed to.

use std::any::Any;
use std::rc::Rc;

use thiserror::Error;

/// A fault caught at the point a hook or handler was invoked.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A hook returned `Err`. The hook counted as "continue".
    #[error("message hook failed on {msg_type:?}: {source}")]
    Hook {
        msg_type: String,
        #[source]
        source: anyhow::Error,
    },

    /// A handler returned `Err`.
    #[error("message handler failed on {msg_type:?}: {source}")]
    Handler {
        msg_type: String,
        #[source]
        source: anyhow::Error,
    },

    /// A hook panicked. The hook counted as "continue".
    #[error("message hook panicked on {msg_type:?}: {reason}")]
    HookPanic { msg_type: String, reason: String },

    /// A handler panicked.
    #[error("message handler panicked on {msg_type:?}: {reason}")]
    HandlerPanic { msg_type: String, reason: String },

    /// A queued message panicked while absorbing a newer post. The queued
    /// message stays queued and the newer one is queued after it.
    #[error("message conflation panicked on {msg_type:?}: {reason}")]
    ConflatePanic { msg_type: String, reason: String },
}

impl DispatchError {
    pub fn msg_type(&self) -> &str {
        match self {
            DispatchError::Hook { msg_type, .. }
            | DispatchError::Handler { msg_type, .. }
            | DispatchError::HookPanic { msg_type, .. }
            | DispatchError::HandlerPanic { msg_type, .. }
            | DispatchError::ConflatePanic { msg_type, .. } => msg_type,
        }
    }

    /// Whether the fault came from a hook rather than the handler.
    pub fn is_hook_fault(&self) -> bool {
        matches!(
            self,
            DispatchError::Hook { .. } | DispatchError::HookPanic { .. }
        )
    }

    pub fn is_panic(&self) -> bool {
        matches!(
            self,
            DispatchError::HookPanic { .. }
                | DispatchError::HandlerPanic { .. }
                | DispatchError::ConflatePanic { .. }
        )
    }
}

/// Receives every fault the loop catches. Replace it with
/// `MessageLoop::set_exception_handler` to change how failures surface;
/// panicking from it is how an integrator opts into fail-fast.
pub type ExceptionHandler = Rc<dyn Fn(&DispatchError)>;

/// The handler a fresh loop starts with: log and carry on.
pub fn default_exception_handler() -> ExceptionHandler {
    Rc::new(|err: &DispatchError| {
        tracing::error!(
            msg_type = err.msg_type(),
            hook = err.is_hook_fault(),
            panic = err.is_panic(),
            "{err}"
        );
    })
}

/// Best-effort text for a caught panic payload.
pub(crate) fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_message_type() {
        let err = DispatchError::Handler {
            msg_type: "resize".into(),
            source: anyhow::anyhow!("widget detached"),
        };
        assert_eq!(
            err.to_string(),
            "message handler failed on \"resize\": widget detached"
        );
        assert!(!err.is_hook_fault());
        assert!(!err.is_panic());
    }

    #[test]
    fn panic_reason_reads_common_payloads() {
        let caught = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_reason(caught.as_ref()), "boom");

        let n = 7;
        let caught = std::panic::catch_unwind(|| panic!("boom {n}")).unwrap_err();
        assert_eq!(panic_reason(caught.as_ref()), "boom 7");
    }

    #[test]
    fn hook_panic_is_classified() {
        let err = DispatchError::HookPanic {
            msg_type: "fit-request".into(),
            reason: "boom".into(),
        };
        assert!(err.is_hook_fault());
        assert!(err.is_panic());
        assert_eq!(err.msg_type(), "fit-request");
    }
}
