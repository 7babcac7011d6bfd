//! Encoder session controller with broadcast output.
//!
//! - [`encoder`]: [`VideoEncoder`], the public controller
//! - [`hub`]: fan-out of encoder output to subscribers
//! - [`session`]: handle lifecycle, invalidation and lazy recreation
//! - [`trigger`]: external invalidation signal
//! - `worker`: confinement thread and output pump

pub mod encoder;
pub mod hub;
pub mod session;
pub mod trigger;
mod worker;

pub use encoder::VideoEncoder;
pub use hub::{BroadcastHub, Subscription, SubscriptionId, TryRecvError};
pub use session::{InvalidationCause, SessionState, SessionStats};
pub use trigger::{InvalidationTrigger, TriggerListener};

/// Errors returned by [`VideoEncoder`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("encoder controller is shut down")]
    Closed,

    #[error("failed to spawn {name} thread")]
    SpawnThread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build encoder session runtime")]
    Runtime(#[source] std::io::Error),
}
