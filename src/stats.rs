use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic counters shared by every session a [`Listener`](crate::Listener)
/// or dialed [`Session`](crate::Session) owns: plain cross-thread
/// `AtomicU64` signals, generalized from a handful of per-session flags to
/// the full counter set the protocol wants for observability.
#[derive(Debug, Default)]
pub struct Stats {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub in_pkts: AtomicU64,
    pub out_pkts: AtomicU64,
    pub in_bytes: AtomicU64,
    pub out_bytes: AtomicU64,
    pub in_errs: AtomicU64,
    pub in_csum_errors: AtomicU64,
    pub kcp_in_errors: AtomicU64,
    pub fec_errs: AtomicU64,
    pub fec_recovered: AtomicU64,
    pub fec_parity_shards: AtomicU64,
    pub active_opens: AtomicU64,
    pub passive_opens: AtomicU64,
    pub curr_estab: AtomicU64,
    pub max_conn: AtomicU64,
    pub retrans_segs: AtomicU64,
}

macro_rules! counter_ops {
    ($($field:ident => $incr:ident),* $(,)?) => {
        $(
            pub fn $incr(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    counter_ops! {
        bytes_sent => incr_bytes_sent,
        bytes_received => incr_bytes_received,
        in_pkts => incr_in_pkts,
        out_pkts => incr_out_pkts,
        in_bytes => incr_in_bytes,
        out_bytes => incr_out_bytes,
        in_errs => incr_in_errs,
        in_csum_errors => incr_in_csum_errors,
        kcp_in_errors => incr_kcp_in_errors,
        fec_errs => incr_fec_errs,
        fec_recovered => incr_fec_recovered,
        fec_parity_shards => incr_fec_parity_shards,
        active_opens => incr_active_opens,
        passive_opens => incr_passive_opens,
        retrans_segs => incr_retrans_segs,
    }

    pub fn conn_opened(&self) {
        let n = self.curr_estab.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_conn.fetch_max(n, Ordering::Relaxed);
    }

    pub fn conn_closed(&self) {
        self.curr_estab.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            in_pkts: self.in_pkts.load(Ordering::Relaxed),
            out_pkts: self.out_pkts.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            in_errs: self.in_errs.load(Ordering::Relaxed),
            in_csum_errors: self.in_csum_errors.load(Ordering::Relaxed),
            kcp_in_errors: self.kcp_in_errors.load(Ordering::Relaxed),
            fec_errs: self.fec_errs.load(Ordering::Relaxed),
            fec_recovered: self.fec_recovered.load(Ordering::Relaxed),
            fec_parity_shards: self.fec_parity_shards.load(Ordering::Relaxed),
            active_opens: self.active_opens.load(Ordering::Relaxed),
            passive_opens: self.passive_opens.load(Ordering::Relaxed),
            curr_estab: self.curr_estab.load(Ordering::Relaxed),
            max_conn: self.max_conn.load(Ordering::Relaxed),
            retrans_segs: self.retrans_segs.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Stats`], for callers that want a `Copy` snapshot
/// rather than touching the atomics directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub in_pkts: u64,
    pub out_pkts: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub in_errs: u64,
    pub in_csum_errors: u64,
    pub kcp_in_errors: u64,
    pub fec_errs: u64,
    pub fec_recovered: u64,
    pub fec_parity_shards: u64,
    pub active_opens: u64,
    pub passive_opens: u64,
    pub curr_estab: u64,
    pub max_conn: u64,
    pub retrans_segs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curr_estab_tracks_opens_and_closes() {
        let stats = Stats::new();
        stats.conn_opened();
        stats.conn_opened();
        stats.conn_closed();
        let snap = stats.snapshot();
        assert_eq!(snap.curr_estab, 1);
        assert_eq!(snap.max_conn, 2);
    }
}
