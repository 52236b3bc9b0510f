//! Kuyala hub: the live state broadcast core.
//!
//! One [`WatchLoop`], one stats poller and one delayed stats consumer feed a
//! shared [`Broadcaster`]; each connected client is a [`SubscriberSession`]
//! draining its own bounded queue.

#![forbid(unsafe_code)]

pub mod broadcaster;
pub mod subscriber;
pub mod timings;
pub mod triggers;
pub mod watch_loop;

pub use broadcaster::{Broadcaster, PublishReport, Registration, Shared, SubscriberId, Subscription, SUBSCRIBER_QUEUE_CAPACITY};
pub use subscriber::{SessionEnd, SubscriberSession};
pub use timings::Timings;
pub use triggers::{compute_stats, run_delayed_stats, run_stats_poller, StatsTrigger};
pub use watch_loop::{WatchLoop, WatchState};
