//! Bounded queues with two extra runtime behaviors:
//!
//! - [MutableQueue] - capacity can be changed while the queue is in use,
//!   without losing, duplicating or reordering items.
//! - [BroadcastQueue] - every item is delivered to every subscriber[^broadcast].
//!   Subscribers come and go at any time, and each one has its own
//!   backpressure: a slow subscriber does not block the producer or others.
//!
//! [^broadcast]: From the moment of subscription.
//!
//! Both are built from blocking channels, and each queue is served by two
//! background threads: an intake thread behind the producer-facing admission
//! point, and a delivery thread in front of the consumers. Both threads stop
//! on their own after [close()](MutableQueue::close) once everything admitted
//! was handed on.
//!
//! # Order
//!
//! [MutableQueue] is FIFO across any number of resizes.
//!
//! [BroadcastQueue] is FIFO per subscriber. Different subscribers may
//! observe items at different times.
//!
//! # Backlog memory
//!
//! By default a subscriber that does not read accumulates an unbounded
//! backlog. Set [BroadcastConfig::backlog_limit] to cap it. On close, backlog
//! is dropped unless it reaches the subscriber within
//! [BroadcastConfig::close_grace].
//!
//! # Logging
//!
//! Lifecycle events are reported through [tracing]. No subscriber is
//! installed by this crate.

mod config;
mod error;
mod reader;

pub mod broadcast;
pub mod mutable;

pub use broadcast::{BroadcastQueue, Subscription};
pub use config::*;
pub use error::*;
pub use mutable::MutableQueue;
pub use reader::*;
