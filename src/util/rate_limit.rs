//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified messages per second
pub fn create_limiter(per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Per-connection inbound message limiter on the relay
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    inbound: Arc<Limiter>,
}

impl ConnectionRateLimiter {
    pub fn new(per_second: u32) -> Self {
        Self {
            inbound: create_limiter(per_second),
        }
    }

    /// Check if an inbound message is allowed (returns true if allowed)
    pub fn check_inbound(&self) -> bool {
        self.inbound.check().is_ok()
    }
}
