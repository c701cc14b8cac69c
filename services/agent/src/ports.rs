//! Host port allocation for containers that request port 0.

use std::sync::atomic::{AtomicU16, Ordering};

/// First port handed out by the allocator.
pub const PORT_RANGE_START: u16 = 30000;

static NEXT_PORT: AtomicU16 = AtomicU16::new(PORT_RANGE_START);

/// Allocate the next host port. Process-wide monotonic sequence; ports are
/// never returned to the pool, the range is large enough to outlive any
/// realistic agent uptime.
pub fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}
