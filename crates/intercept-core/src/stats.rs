//! Global interception counters.
//!
//! All writes use `Relaxed` ordering; nothing synchronises on these values.
//! They increase monotonically and reset only on restart.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

pub struct InterceptStats {
    /// Every packet that reached classification.
    pub tot_resp_packs: AtomicU64,
    /// Packets suppressed and forwarded upstream.
    pub tot_copy_resp_packs: AtomicU64,
    /// Cumulative routing registrations (`CLIENT_ADD` messages).
    pub tot_router_items: AtomicU64,
}

/// Plain-struct snapshot for display and assertions (no atomics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tot_resp_packs: u64,
    pub tot_copy_resp_packs: u64,
    pub tot_router_items: u64,
}

impl InterceptStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tot_resp_packs: AtomicU64::new(0),
            tot_copy_resp_packs: AtomicU64::new(0),
            tot_router_items: AtomicU64::new(0),
        })
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tot_resp_packs: self.tot_resp_packs.load(Relaxed),
            tot_copy_resp_packs: self.tot_copy_resp_packs.load(Relaxed),
            tot_router_items: self.tot_router_items.load(Relaxed),
        }
    }

    /// One periodic log line, emitted from the maintenance timer.
    pub fn emit(&self) {
        let s = self.snapshot();
        tracing::info!(
            "intercepted:{} classified:{} registrations:{}",
            s.tot_copy_resp_packs,
            s.tot_resp_packs,
            s.tot_router_items
        );
    }
}

/// Monotonic seconds, used for routing-entry ages.
pub fn now_secs() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64
}
