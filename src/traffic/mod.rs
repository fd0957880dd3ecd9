//! Admission control that sits above the queue: per-subject rate limiting
//! and global priority-capacity accounting.

pub mod capacity;
pub mod rate_limit;

pub use capacity::{GlobalCapacity, Priority, PriorityCapacityTracker};
pub use rate_limit::{Mode, RateLimit, RateLimitContext, TrafficShapingRateLimiter};
