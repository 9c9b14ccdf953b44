use serde::Serialize;

/// Running counters for one loop instance. Snapshots are cheap copies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    /// `send_message` calls.
    pub sent: u64,
    /// `post_message` calls, absorbed ones included.
    pub posted: u64,
    /// Posts absorbed into an already-queued message.
    pub conflated: u64,
    /// Handler invocations, from sends and loop runs alike.
    pub delivered: u64,
    /// Deliveries stopped by a hook returning `false`.
    pub vetoed: u64,
    pub hook_faults: u64,
    pub handler_faults: u64,
    /// Panics caught inside `Message::conflate`.
    pub conflate_faults: u64,
    /// Loop runs that found a non-empty queue.
    pub runs: u64,
    pub cleanup_passes: u64,
    /// Tombstoned hook slots reclaimed by cleanup.
    pub slots_reclaimed: u64,
}
