use std::time::Duration;

/// Default per-subscriber buffer depth.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 64;

/// Default delay between delivery attempts to backlogged subscribers.
pub const DEFAULT_REPOLL_INTERVAL: Duration = Duration::from_millis(1);

/// Depth of [MutableQueue] resize control channel.
///
/// [MutableQueue]: crate::MutableQueue
pub const RESIZE_SLOTS: usize = 8;

/// What to drop when a subscriber backlog hits [BroadcastConfig::backlog_limit].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BacklogOverflow {
    /// Drop the oldest undelivered item, keep the incoming one.
    #[default]
    DropOldest,
    /// Drop the incoming item.
    DropNewest,
}

/// [BroadcastQueue] configuration.
///
/// [BroadcastQueue]: crate::BroadcastQueue
#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    /// Depth of every subscriber's output buffer. Also the depth of the
    /// internal distribution queue.
    pub capacity: usize,

    /// Maximum number of items kept per subscriber on top of its output
    /// buffer. `None` means the backlog grows without limit.
    pub backlog_limit: Option<usize>,

    /// Applied when `backlog_limit` is reached.
    pub overflow: BacklogOverflow,

    /// How long the delivery thread waits for new items before it retries
    /// backlogged subscribers.
    pub repoll_interval: Duration,

    /// How long, after close, backlogged subscribers get to catch up before
    /// their outputs are closed and the rest of their backlog is dropped.
    /// Zero closes right after the last admitted item was replicated.
    pub close_grace: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BROADCAST_CAPACITY,
            backlog_limit: None,
            overflow: BacklogOverflow::default(),
            repoll_interval: DEFAULT_REPOLL_INTERVAL,
            close_grace: Duration::ZERO,
        }
    }
}

impl BroadcastConfig {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_backlog_limit(mut self, limit: usize, overflow: BacklogOverflow) -> Self {
        self.backlog_limit = Some(limit);
        self.overflow = overflow;
        self
    }

    #[must_use]
    pub fn with_repoll_interval(mut self, interval: Duration) -> Self {
        self.repoll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }
}
