//! The dispatch loop.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::cleanup::DirtySet;
use crate::config::LoopConfig;
use crate::error::{default_exception_handler, panic_reason, DispatchError, ExceptionHandler};
use crate::handler::{HandlerId, HandlerRef};
use crate::hook::HookRef;
use crate::message::Message;
use crate::queue::{MessageQueue, Popped, RunId};
use crate::registry::HookRegistry;
use crate::scheduler::{CancelToken, Scheduler};
use crate::stats::LoopStats;

/// Single-threaded message dispatcher.
///
/// `send_message` delivers immediately; `post_message` queues and lets the
/// scheduler drive a loop run later. Hooks installed on a handler see every
/// message first, newest hook first, and can veto delivery.
///
/// `MessageLoop` is a cheap handle: clones share one engine. No internal
/// borrow is held while hooks, handlers, `conflate` or the exception handler
/// run, so all of them may call back into the loop.
#[derive(Clone)]
pub struct MessageLoop {
    inner: Rc<Inner>,
}

/// Non-owning handle, for hooks and handlers that keep a reference to the
/// loop they are registered with.
#[derive(Clone)]
pub struct WeakMessageLoop {
    inner: Weak<Inner>,
}

struct Inner {
    scheduler: Rc<dyn Scheduler>,
    config: LoopConfig,
    state: RefCell<LoopState>,
    exception_handler: RefCell<ExceptionHandler>,
    stats: Cell<LoopStats>,
    next_run: Cell<RunId>,
    /// Re-entrancy guard for `flush`.
    flushing: Cell<bool>,
    /// Deliveries and `conflate` calls currently on the stack.
    dispatch_depth: Cell<usize>,
    /// A cleanup pass found `dispatch_depth > 0` and is waiting for the
    /// outermost dispatch to return.
    cleanup_parked: Cell<bool>,
}

#[derive(Default)]
struct LoopState {
    queue: MessageQueue,
    hooks: HookRegistry,
    dirty: DirtySet,
    pending_run: Option<CancelToken>,
}

/// Resets a `Cell` counter or flag when dropped, unwinding included.
struct DepthGuard<'a>(&'a Cell<usize>);

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a Cell<usize>) -> Self {
        depth.set(depth.get() + 1);
        Self(depth)
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

struct FlushGuard<'a>(&'a Cell<bool>);

impl<'a> FlushGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl MessageLoop {
    pub fn new(scheduler: impl Scheduler + 'static) -> Self {
        Self::with_config(scheduler, LoopConfig::default())
    }

    pub fn with_config(scheduler: impl Scheduler + 'static, config: LoopConfig) -> Self {
        Self {
            inner: Rc::new(Inner {
                scheduler: Rc::new(scheduler),
                config,
                state: RefCell::new(LoopState::default()),
                exception_handler: RefCell::new(default_exception_handler()),
                stats: Cell::new(LoopStats::default()),
                next_run: Cell::new(0),
                flushing: Cell::new(false),
                dispatch_depth: Cell::new(0),
                cleanup_parked: Cell::new(false),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakMessageLoop {
        WeakMessageLoop {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Deliver `msg` to `handler` now, through the handler's hooks.
    ///
    /// Faults from hooks or the handler go to the exception handler; this
    /// call always returns normally (unless the exception handler panics).
    pub fn send_message(&self, handler: &HandlerRef, msg: &dyn Message) {
        self.bump(|s| s.sent += 1);
        self.invoke(handler, msg);
    }

    /// Queue `msg` for `handler` and make sure a loop run is scheduled.
    ///
    /// A conflatable message is first offered to the oldest queued message
    /// for the same handler with the same type; if that message absorbs it,
    /// nothing new is queued.
    pub fn post_message(&self, handler: &HandlerRef, msg: Box<dyn Message>) {
        self.bump(|s| s.posted += 1);
        let Some(msg) = self.try_conflate(handler, msg) else {
            self.bump(|s| s.conflated += 1);
            return;
        };
        trace!(
            handler = %HandlerId::of(handler),
            msg_type = msg.msg_type(),
            "message queued"
        );
        self.inner
            .state
            .borrow_mut()
            .queue
            .push(Rc::clone(handler), msg);
        self.schedule_run();
    }

    /// Returns the message back when it still has to be queued.
    fn try_conflate(&self, handler: &HandlerRef, msg: Box<dyn Message>) -> Option<Box<dyn Message>> {
        if !msg.is_conflatable() {
            return Some(msg);
        }
        let id = HandlerId::of(handler);

        let target = self
            .inner
            .state
            .borrow()
            .queue
            .find_conflation_target(id, msg.msg_type());
        let Some(seq) = target else {
            return Some(msg);
        };
        let taken = self.inner.state.borrow_mut().queue.take_message(seq);
        let Some(mut existing) = taken else {
            return Some(msg);
        };

        // The queue is not borrowed while user code runs. A panic is caught
        // here whatever the config says, so the queued message is put back
        // before the panic is reported or resumed.
        let outcome = self.dispatching(|| {
            panic::catch_unwind(AssertUnwindSafe(|| existing.conflate(&*msg)))
        });

        let restored = self
            .inner
            .state
            .borrow_mut()
            .queue
            .restore_message(seq, existing);
        if !restored {
            // The target's handler was cleared from inside `conflate`.
            debug!(handler = %id, msg_type = msg.msg_type(), "conflation target cleared");
        }

        let absorbed = match outcome {
            Ok(absorbed) => absorbed,
            Err(payload) => {
                if !self.inner.config.catch_panics {
                    panic::resume_unwind(payload);
                }
                self.bump(|s| s.conflate_faults += 1);
                self.report(DispatchError::ConflatePanic {
                    msg_type: msg.msg_type().to_string(),
                    reason: panic_reason(payload.as_ref()),
                });
                false
            }
        };

        if absorbed {
            trace!(handler = %id, msg_type = msg.msg_type(), "message conflated");
            None
        } else {
            Some(msg)
        }
    }

    /// Hook chain (newest first), then the handler.
    ///
    /// The whole chain counts as one dispatch, exception handler calls
    /// included, so hook lists are never compacted under it.
    fn invoke(&self, handler: &HandlerRef, msg: &dyn Message) {
        self.dispatching(|| self.run_chain(handler, msg));
    }

    fn run_chain(&self, handler: &HandlerRef, msg: &dyn Message) {
        let id = HandlerId::of(handler);

        // Hooks appended while this chain runs sit past `slots` and are not
        // called; hooks tombstoned ahead of the cursor are skipped.
        let slots = self.inner.state.borrow().hooks.len_of(id);
        for index in (0..slots).rev() {
            let hook = self.inner.state.borrow().hooks.hook_at(id, index);
            let Some(hook) = hook else {
                continue;
            };
            if !self.run_hook(&hook, handler, msg) {
                self.bump(|s| s.vetoed += 1);
                trace!(handler = %id, msg_type = msg.msg_type(), "delivery vetoed by hook");
                return;
            }
        }

        self.run_handler(handler, msg);
    }

    /// Faulting hooks count as `true`.
    fn run_hook(&self, hook: &HookRef, handler: &HandlerRef, msg: &dyn Message) -> bool {
        match self.guarded(|| hook.message_hook(handler, msg)) {
            Ok(Ok(keep_going)) => keep_going,
            Ok(Err(source)) => {
                self.bump(|s| s.hook_faults += 1);
                self.report(DispatchError::Hook {
                    msg_type: msg.msg_type().to_string(),
                    source,
                });
                true
            }
            Err(reason) => {
                self.bump(|s| s.hook_faults += 1);
                self.report(DispatchError::HookPanic {
                    msg_type: msg.msg_type().to_string(),
                    reason,
                });
                true
            }
        }
    }

    fn run_handler(&self, handler: &HandlerRef, msg: &dyn Message) {
        self.bump(|s| s.delivered += 1);
        trace!(
            handler = %HandlerId::of(handler),
            msg_type = msg.msg_type(),
            "delivering message"
        );
        let fault = match self.guarded(|| handler.process_message(msg)) {
            Ok(Ok(())) => return,
            Ok(Err(source)) => DispatchError::Handler {
                msg_type: msg.msg_type().to_string(),
                source,
            },
            Err(reason) => DispatchError::HandlerPanic {
                msg_type: msg.msg_type().to_string(),
                reason,
            },
        };
        self.bump(|s| s.handler_faults += 1);
        self.report(fault);
    }

    /// Run `f` with the dispatch depth raised. When the outermost dispatch
    /// returns, a cleanup pass that was parked meanwhile is rescheduled.
    fn dispatching<T>(&self, f: impl FnOnce() -> T) -> T {
        let out = {
            let _depth = DepthGuard::enter(&self.inner.dispatch_depth);
            f()
        };
        if self.inner.dispatch_depth.get() == 0 && self.inner.cleanup_parked.replace(false) {
            self.schedule_task(MessageLoop::run_cleanup);
            trace!("parked hook cleanup rescheduled");
        }
        out
    }

    /// Run user code, catching panics when configured to.
    fn guarded<T>(&self, f: impl FnOnce() -> T) -> Result<T, String> {
        if !self.inner.config.catch_panics {
            return Ok(f());
        }
        panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_reason(payload.as_ref()))
    }

    fn report(&self, err: DispatchError) {
        let handler = self.exception_handler();
        handler(&err);
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    /// Install `hook` on `handler`. Installing a hook that is already live on
    /// the handler does nothing. The newest hook runs first.
    pub fn install_message_hook(&self, handler: &HandlerRef, hook: HookRef) {
        let id = HandlerId::of(handler);
        let added = self.inner.state.borrow_mut().hooks.install(id, hook);
        if added {
            trace!(handler = %id, "message hook installed");
        }
    }

    /// Remove `hook` from `handler`. Safe to call from inside the hook (or
    /// any hook on the same chain); a chain already past the hook is not
    /// affected. Removing a hook that is not installed does nothing.
    pub fn remove_message_hook(&self, handler: &HandlerRef, hook: &HookRef) {
        let id = HandlerId::of(handler);
        let removed = self.inner.state.borrow_mut().hooks.remove(id, hook);
        if removed {
            trace!(handler = %id, "message hook removed");
            self.mark_dirty(id);
        }
    }

    /// Drop every hook on `handler` and every message still queued for it.
    ///
    /// Owners call this when tearing a handler down. A delivery already in
    /// progress for the handler is not interrupted.
    pub fn clear_data(&self, handler: &HandlerRef) {
        let id = HandlerId::of(handler);
        let (hooks, messages, had_list) = {
            let mut state = self.inner.state.borrow_mut();
            let had_list = state.hooks.len_of(id) > 0;
            let hooks = state.hooks.clear(id);
            let messages = state.queue.invalidate_handler(id);
            (hooks, messages, had_list)
        };
        debug!(handler = %id, hooks, messages, "handler data cleared");
        if had_list {
            self.mark_dirty(id);
        }
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Run the pending loop run now, if one is scheduled.
    ///
    /// Calls made while a flush is already running (from a handler, say) do
    /// nothing.
    pub fn flush(&self) {
        if self.inner.flushing.get() {
            return;
        }
        let pending = self.inner.state.borrow_mut().pending_run.take();
        let Some(token) = pending else {
            return;
        };
        token.cancel();
        let _flushing = FlushGuard::enter(&self.inner.flushing);
        self.run_loop();
    }

    fn schedule_run(&self) {
        if self.inner.state.borrow().pending_run.is_some() {
            return;
        }
        let token = self.schedule_task(MessageLoop::run_loop);
        self.inner.state.borrow_mut().pending_run = Some(token);
        trace!("loop run scheduled");
    }

    fn schedule_task(&self, task: fn(&MessageLoop)) -> CancelToken {
        let weak = Rc::downgrade(&self.inner);
        self.inner.scheduler.schedule(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                task(&MessageLoop { inner });
            }
        }))
    }

    /// Drain the queue up to a sentinel appended at the start of the run.
    /// Anything posted during the run waits for the next one.
    fn run_loop(&self) {
        let run = {
            let mut state = self.inner.state.borrow_mut();
            state.pending_run = None;
            if state.queue.is_empty() {
                return;
            }
            let run = self.inner.next_run.get();
            self.inner.next_run.set(run + 1);
            state.queue.push_sentinel(run);
            run
        };

        let mut delivered = 0usize;
        let mut skipped = 0usize;
        loop {
            let popped = self.inner.state.borrow_mut().queue.pop(run);
            match popped {
                None | Some(Popped::EndOfRun) => break,
                Some(Popped::Skip) => skipped += 1,
                Some(Popped::Deliver(handler, msg)) => {
                    delivered += 1;
                    self.invoke(&handler, &*msg);
                }
            }
        }

        self.bump(|s| s.runs += 1);
        debug!(run, delivered, skipped, "loop run finished");
        let threshold = self.inner.config.run_warn_threshold;
        if threshold > 0 && delivered > threshold {
            warn!(run, delivered, threshold, "loop run drained an unusually large queue");
        }
    }

    // -----------------------------------------------------------------------
    // Deferred cleanup
    // -----------------------------------------------------------------------

    fn mark_dirty(&self, id: HandlerId) {
        let first = self.inner.state.borrow_mut().dirty.mark(id);
        if first {
            self.schedule_task(MessageLoop::run_cleanup);
            trace!("hook cleanup scheduled");
        }
    }

    fn run_cleanup(&self) {
        if self.inner.dispatch_depth.get() > 0 {
            // The scheduler was driven from inside a delivery; the list being
            // compacted may be mid-iteration.
            self.inner.cleanup_parked.set(true);
            return;
        }
        let report = {
            let mut state = self.inner.state.borrow_mut();
            let LoopState { hooks, dirty, .. } = &mut *state;
            dirty.sweep(hooks)
        };
        self.bump(|s| {
            s.cleanup_passes += 1;
            s.slots_reclaimed += report.reclaimed as u64;
        });
        debug!(lists = report.lists, reclaimed = report.reclaimed, "hook lists compacted");
    }

    // -----------------------------------------------------------------------
    // Exception handler
    // -----------------------------------------------------------------------

    pub fn exception_handler(&self) -> ExceptionHandler {
        Rc::clone(&self.inner.exception_handler.borrow())
    }

    /// Replace the exception handler, returning the previous one so callers
    /// can restore it.
    pub fn set_exception_handler(&self, handler: ExceptionHandler) -> ExceptionHandler {
        self.inner.exception_handler.replace(handler)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> LoopStats {
        self.inner.stats.get()
    }

    pub fn is_run_scheduled(&self) -> bool {
        self.inner.state.borrow().pending_run.is_some()
    }

    /// Physical queue length, including blanked entries not yet popped.
    pub fn pending_len(&self) -> usize {
        self.inner.state.borrow().queue.len()
    }

    /// Live messages queued for `handler`.
    pub fn queued_for(&self, handler: &HandlerRef) -> usize {
        self.inner
            .state
            .borrow()
            .queue
            .live_count_for(HandlerId::of(handler))
    }

    /// Live hooks installed on `handler`.
    pub fn hook_count(&self, handler: &HandlerRef) -> usize {
        self.inner
            .state
            .borrow()
            .hooks
            .live_count(HandlerId::of(handler))
    }

    /// Hook slots held for `handler`, tombstones included.
    pub fn hook_slots(&self, handler: &HandlerRef) -> usize {
        self.inner
            .state
            .borrow()
            .hooks
            .len_of(HandlerId::of(handler))
    }

    fn bump(&self, f: impl FnOnce(&mut LoopStats)) {
        let mut stats = self.inner.stats.get();
        f(&mut stats);
        self.inner.stats.set(stats);
    }
}

impl fmt::Debug for MessageLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.try_borrow();
        let mut out = f.debug_struct("MessageLoop");
        match state {
            Ok(state) => out
                .field("queued", &state.queue.len())
                .field("hooked_handlers", &state.hooks.handler_count())
                .field("dirty_lists", &state.dirty.len())
                .field("run_scheduled", &state.pending_run.is_some()),
            Err(_) => out.field("state", &"<borrowed>"),
        };
        out.field("stats", &self.inner.stats.get()).finish()
    }
}

impl WeakMessageLoop {
    pub fn upgrade(&self) -> Option<MessageLoop> {
        self.inner.upgrade().map(|inner| MessageLoop { inner })
    }
}

impl fmt::Debug for WeakMessageLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakMessageLoop")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
