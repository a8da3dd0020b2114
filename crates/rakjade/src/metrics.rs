use std::sync::atomic::{AtomicU64, Ordering};

/// Global transport counters, updated with relaxed fetch-adds on the hot
/// path and read only for telemetry.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub packets_in: AtomicU64,
    pub packets_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub acks_in: AtomicU64,
    pub naks_in: AtomicU64,
    pub resends: AtomicU64,
    /// Datagrams given up on after the retransmission cap.
    pub failed_resends: AtomicU64,
    pub denied_connection_requests: AtomicU64,
    /// Current session count; a gauge, not an admission authority.
    pub sessions: AtomicU64,
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub acks_in: u64,
    pub naks_in: u64,
    pub resends: u64,
    pub failed_resends: u64,
    pub denied_connection_requests: u64,
    pub sessions: u64,
}

impl ServerMetrics {
    #[inline]
    pub fn count_in(&self, bytes: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn count_out(&self, bytes: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            acks_in: self.acks_in.load(Ordering::Relaxed),
            naks_in: self.naks_in.load(Ordering::Relaxed),
            resends: self.resends.load(Ordering::Relaxed),
            failed_resends: self.failed_resends.load(Ordering::Relaxed),
            denied_connection_requests: self.denied_connection_requests.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
        }
    }
}
