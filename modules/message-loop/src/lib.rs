//! Single-threaded message dispatch.
//!
//! A [`MessageLoop`] delivers messages to handlers either immediately
//! ([`MessageLoop::send_message`]) or on the next loop run
//! ([`MessageLoop::post_message`]). Hooks installed on a handler intercept its
//! messages newest-first and may veto delivery. Queued conflatable messages
//! absorb later duplicates, so a burst of "update" requests costs one
//! delivery.
//!
//! The loop owns no threads. Runs and hook-list cleanup are handed to an
//! injected [`Scheduler`]: [`ManualScheduler`] for deterministic tests,
//! [`LocalTaskScheduler`] to run on a tokio `LocalSet`.

mod cleanup;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod hook;
pub mod message;
mod queue;
mod registry;
pub mod scheduler;
pub mod stats;

pub use config::LoopConfig;
pub use engine::{MessageLoop, WeakMessageLoop};
pub use error::{default_exception_handler, DispatchError, ExceptionHandler};
pub use handler::{HandlerId, HandlerRef, MessageHandler};
pub use hook::{HookRef, MessageHook};
pub use message::{BasicMessage, ConflatableMessage, Message};
pub use scheduler::{CancelToken, LocalTaskScheduler, ManualScheduler, Scheduler, Task};
pub use stats::LoopStats;
