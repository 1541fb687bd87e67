//! Round-trip latency probe.
//!
//! Each outgoing buffer carries a 16-byte header followed by the pattern
//! payload for its sequence id:
//!
//! ```text
//! 0        8                16
//! +--------+----------------+-------------------------+
//! | seq id | send timestamp | pattern(seq id) ...     |
//! +--------+----------------+-------------------------+
//!   u64 LE       u64 LE
//! ```
//!
//! Replies are matched to pending requests by sequence id only, so they may
//! arrive in any order. Every request ends in exactly one of three states:
//!
//! - **matched**: a reply arrived; it yields a sample, valid only if the
//!   payload verifies. Warmup replies are counted apart from the rest
//! - **lost**: evicted after the request timeout (or to make room)
//! - any further reply for the same id is a **duplicate**, including late
//!   replies for requests that were already declared lost

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::driver::config::BenchConfig;
use crate::error::Error;
use crate::hal::clock::Clock;
use crate::internal::constants::{EVICTION_SCAN_BUDGET, PROBE_HEADER_SIZE};
use crate::pattern::{PatternGenerator, digest};
use crate::stats::LatencySample;

/// In-flight correlation record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    /// Probe id
    pub sequence_id: u64,
    /// Clock reading when the probe was tagged
    pub send_timestamp: u64,
    /// FNV-1a digest of the payload after the header
    pub payload_digest: u64,
}

/// Classification of a received buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// First reply for a pending request
    Matched {
        /// Probe id
        sequence_id: u64,
        /// Round trip; invalid if the payload failed verification
        sample: LatencySample,
        /// Probe belongs to the warmup phase
        warmup: bool,
    },
    /// No pending request for this id
    Duplicate {
        /// Probe id read from the header
        sequence_id: u64,
    },
    /// Buffer too short to carry a header
    Malformed,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeCounters {
    /// Probes tagged
    pub sent: u64,
    /// Replies matched with a verified payload (warmup excluded)
    pub matched: u64,
    /// Replies matched with a corrupted payload (warmup excluded)
    pub corrupt: u64,
    /// Warmup replies matched, verified or not
    pub warmup: u64,
    /// Replies without a pending request
    pub duplicates: u64,
    /// Requests evicted without a reply
    pub lost: u64,
    /// Buffers too short for a header
    pub malformed: u64,
    /// Requests still pending
    pub in_flight: u64,
}

#[derive(Debug, Default)]
struct AtomicProbeCounters {
    sent: AtomicU64,
    matched: AtomicU64,
    corrupt: AtomicU64,
    warmup: AtomicU64,
    duplicates: AtomicU64,
    lost: AtomicU64,
    malformed: AtomicU64,
}

/// Sequence-id correlation between sent probes and their replies.
pub struct LatencyProbe {
    generator: PatternGenerator,
    clock: Arc<dyn Clock>,
    timeout_ns: u64,
    capacity: usize,
    warmup: u64,
    verify: bool,
    verbose: bool,
    next_id: AtomicU64,
    pending: Mutex<BTreeMap<u64, PendingRequest>>,
    counters: AtomicProbeCounters,
    sending_done: AtomicBool,
}

impl LatencyProbe {
    /// Create a probe holding at most `capacity` pending requests
    pub fn new(generator: PatternGenerator, clock: Arc<dyn Clock>, timeout_ns: u64, capacity: usize) -> Self {
        Self {
            generator,
            clock,
            timeout_ns,
            capacity: capacity.max(1),
            warmup: 0,
            verify: true,
            verbose: false,
            next_id: AtomicU64::new(0),
            pending: Mutex::new(BTreeMap::new()),
            counters: AtomicProbeCounters::default(),
            sending_done: AtomicBool::new(false),
        }
    }

    /// Create a probe from a run configuration
    pub fn from_config(config: &BenchConfig, clock: Arc<dyn Clock>) -> Self {
        let mut probe = Self::new(
            PatternGenerator::new(config.pattern, config.seed),
            clock,
            config.request_timeout.as_nanos() as u64,
            config.max_in_flight,
        );
        probe.warmup = config.warmup as u64;
        probe.verify = config.verify;
        probe.verbose = config.verbose;
        probe
    }

    /// Treat the first `count` ids as warmup
    #[must_use]
    pub fn with_warmup(mut self, count: u64) -> Self {
        self.warmup = count;
        self
    }

    /// Enable or disable payload verification
    #[must_use]
    pub fn with_verify(mut self, enabled: bool) -> Self {
        self.verify = enabled;
        self
    }

    // =========================================================================
    // Send Path
    // =========================================================================

    /// Write the next probe into `buf` and register it as pending.
    ///
    /// Returns the probe id, or `None` if `buf` cannot hold a header. When
    /// the pending table is full the oldest request is declared lost first.
    pub fn tag(&self, buf: &mut [u8]) -> Option<u64> {
        if buf.len() < PROBE_HEADER_SIZE {
            return None;
        }

        let sequence_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (header, payload) = buf.split_at_mut(PROBE_HEADER_SIZE);
        self.generator.fill(sequence_id, payload);
        let payload_digest = digest(payload);

        let send_timestamp = self.clock.now_ns();
        header[..8].copy_from_slice(&sequence_id.to_le_bytes());
        header[8..].copy_from_slice(&send_timestamp.to_le_bytes());

        let request = PendingRequest {
            sequence_id,
            send_timestamp,
            payload_digest,
        };
        let evicted = {
            let mut pending = self.pending.lock();
            let evicted = if pending.len() >= self.capacity {
                pending.pop_first().map(|(_, r)| r)
            } else {
                None
            };
            pending.insert(sequence_id, request);
            evicted
        };

        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = evicted {
            self.declare_lost(old.sequence_id);
        }
        Some(sequence_id)
    }

    /// Stop expecting further probes
    pub fn finish_sending(&self) {
        self.sending_done.store(true, Ordering::Release);
    }

    /// Check if the sender has finished
    pub fn is_sending_done(&self) -> bool {
        self.sending_done.load(Ordering::Acquire)
    }

    // =========================================================================
    // Receive Path
    // =========================================================================

    /// Classify a received buffer
    pub fn complete(&self, buf: &[u8]) -> Completion {
        let receive_time = self.clock.now_ns();

        if buf.len() < PROBE_HEADER_SIZE {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            return Completion::Malformed;
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[..8]);
        let sequence_id = u64::from_le_bytes(id);

        let Some(request) = self.pending.lock().remove(&sequence_id) else {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return Completion::Duplicate { sequence_id };
        };

        let round_trip_ns = receive_time.saturating_sub(request.send_timestamp);
        let valid = !self.verify || self.payload_ok(&request, &buf[PROBE_HEADER_SIZE..]);
        let warmup = sequence_id < self.warmup;
        let counter = match (warmup, valid) {
            (true, _) => &self.counters.warmup,
            (false, true) => &self.counters.matched,
            (false, false) => &self.counters.corrupt,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let sample = if valid {
            LatencySample::valid(round_trip_ns)
        } else {
            LatencySample::invalid(round_trip_ns)
        };
        Completion::Matched {
            sequence_id,
            sample,
            warmup,
        }
    }

    fn payload_ok(&self, request: &PendingRequest, payload: &[u8]) -> bool {
        let verification = self.generator.verify(request.sequence_id, payload);
        if !verification.is_ok() {
            warn!(
                "{}",
                Error::DataVerification {
                    mismatches: verification.mismatches
                }
            );
            if self.verbose {
                verification.log(request.sequence_id);
            }
            return false;
        }
        digest(payload) == request.payload_digest
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Declare requests older than the timeout lost.
    ///
    /// Inspects at most a fixed number of the oldest entries per call; the
    /// clock is read before the table is locked. Returns the number evicted.
    pub fn evict_expired(&self) -> u64 {
        let now = self.clock.now_ns();

        let mut expired = Vec::new();
        {
            let mut pending = self.pending.lock();
            while expired.len() < EVICTION_SCAN_BUDGET {
                let Some(entry) = pending.first_entry() else {
                    break;
                };
                if now.saturating_sub(entry.get().send_timestamp) <= self.timeout_ns {
                    break;
                }
                expired.push(entry.remove().sequence_id);
            }
        }

        for sequence_id in &expired {
            self.declare_lost(*sequence_id);
        }
        expired.len() as u64
    }

    fn declare_lost(&self, sequence_id: u64) {
        self.counters.lost.fetch_add(1, Ordering::Relaxed);
        warn!("{}", Error::RequestLost { sequence_id });
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Requests still pending
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Check if the sender is done and every request reached a final state
    pub fn is_drained(&self) -> bool {
        self.is_sending_done() && self.in_flight() == 0
    }

    /// Warmup probe count
    pub fn warmup(&self) -> u64 {
        self.warmup
    }

    /// Counter snapshot
    pub fn counters(&self) -> ProbeCounters {
        let c = &self.counters;
        ProbeCounters {
            sent: c.sent.load(Ordering::Relaxed),
            matched: c.matched.load(Ordering::Relaxed),
            corrupt: c.corrupt.load(Ordering::Relaxed),
            warmup: c.warmup.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            lost: c.lost.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            in_flight: self.in_flight() as u64,
        }
    }
}

impl core::fmt::Debug for LatencyProbe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LatencyProbe")
            .field("generator", &self.generator)
            .field("timeout_ns", &self.timeout_ns)
            .field("capacity", &self.capacity)
            .field("counters", &self.counters())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Pattern;
    use crate::testing::MockClock;

    const TIMEOUT_NS: u64 = 1_000_000;

    fn probe(clock: &MockClock, capacity: usize) -> LatencyProbe {
        LatencyProbe::new(
            PatternGenerator::new(Pattern::Sequential, 0),
            Arc::new(clock.clone()),
            TIMEOUT_NS,
            capacity,
        )
    }

    fn tagged(probe: &LatencyProbe) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        probe.tag(&mut buf).unwrap();
        buf
    }

    // =========================================================================
    // Send Path Tests
    // =========================================================================

    #[test]
    fn tag_writes_header_and_pattern() {
        let clock = MockClock::new();
        clock.set_ns(777);
        let probe = probe(&clock, 8);

        let mut buf = vec![0u8; 64];
        assert_eq!(probe.tag(&mut buf), Some(0));
        assert_eq!(u64::from_le_bytes(buf[..8].try_into().unwrap()), 0);
        assert_eq!(u64::from_le_bytes(buf[8..16].try_into().unwrap()), 777);
        assert!(
            PatternGenerator::new(Pattern::Sequential, 0)
                .verify(0, &buf[16..])
                .is_ok()
        );
        assert_eq!(probe.in_flight(), 1);
        assert_eq!(probe.tag(&mut buf), Some(1));
    }

    #[test]
    fn tag_rejects_short_buffer() {
        let probe = probe(&MockClock::new(), 8);
        let mut buf = [0u8; 8];
        assert_eq!(probe.tag(&mut buf), None);
        assert_eq!(probe.counters().sent, 0);
    }

    #[test]
    fn full_table_evicts_oldest_as_lost() {
        let probe = probe(&MockClock::new(), 2);
        let first = tagged(&probe);
        let _second = tagged(&probe);
        let _third = tagged(&probe);

        let counters = probe.counters();
        assert_eq!(counters.lost, 1);
        assert_eq!(counters.in_flight, 2);
        assert!(matches!(
            probe.complete(&first),
            Completion::Duplicate { sequence_id: 0 }
        ));
    }

    // =========================================================================
    // Receive Path Tests
    // =========================================================================

    #[test]
    fn reply_yields_round_trip() {
        let clock = MockClock::new();
        let probe = probe(&clock, 8);
        clock.set_ns(1_000);
        let buf = tagged(&probe);
        clock.set_ns(6_500);

        match probe.complete(&buf) {
            Completion::Matched {
                sequence_id,
                sample,
                warmup,
            } => {
                assert_eq!(sequence_id, 0);
                assert_eq!(sample, LatencySample::valid(5_500));
                assert!(!warmup);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(probe.counters().matched, 1);
        assert_eq!(probe.in_flight(), 0);
    }

    #[test]
    fn second_reply_is_duplicate() {
        let probe = probe(&MockClock::new(), 8);
        let buf = tagged(&probe);

        assert!(matches!(probe.complete(&buf), Completion::Matched { .. }));
        assert!(matches!(
            probe.complete(&buf),
            Completion::Duplicate { sequence_id: 0 }
        ));
        let counters = probe.counters();
        assert_eq!(counters.matched, 1);
        assert_eq!(counters.duplicates, 1);
    }

    #[test]
    fn out_of_order_replies_match_by_id() {
        let clock = MockClock::new();
        let probe = probe(&clock, 8);
        let a = tagged(&probe);
        clock.advance_ns(100);
        let b = tagged(&probe);
        clock.advance_ns(100);

        let Completion::Matched { sequence_id, sample, .. } = probe.complete(&b) else {
            panic!("expected match");
        };
        assert_eq!((sequence_id, sample.round_trip_ns), (1, 100));
        let Completion::Matched { sequence_id, sample, .. } = probe.complete(&a) else {
            panic!("expected match");
        };
        assert_eq!((sequence_id, sample.round_trip_ns), (0, 200));
    }

    #[test]
    fn corrupted_payload_is_invalid_sample() {
        let probe = probe(&MockClock::new(), 8);
        let mut buf = tagged(&probe);
        buf[40] ^= 0x10;

        let Completion::Matched { sample, .. } = probe.complete(&buf) else {
            panic!("expected match");
        };
        assert!(!sample.valid);
        assert_eq!(probe.counters().corrupt, 1);
        assert_eq!(probe.counters().matched, 0);
    }

    #[test]
    fn corruption_ignored_without_verification() {
        let probe = probe(&MockClock::new(), 8).with_verify(false);
        let mut buf = tagged(&probe);
        buf[40] ^= 0x10;

        let Completion::Matched { sample, .. } = probe.complete(&buf) else {
            panic!("expected match");
        };
        assert!(sample.valid);
    }

    #[test]
    fn short_reply_is_malformed() {
        let probe = probe(&MockClock::new(), 8);
        assert_eq!(probe.complete(&[0u8; 4]), Completion::Malformed);
        assert_eq!(probe.counters().malformed, 1);
    }

    #[test]
    fn warmup_ids_are_flagged() {
        let probe = probe(&MockClock::new(), 8).with_warmup(1);
        let warm = tagged(&probe);
        let real = tagged(&probe);

        assert!(matches!(
            probe.complete(&warm),
            Completion::Matched { warmup: true, .. }
        ));
        assert!(matches!(
            probe.complete(&real),
            Completion::Matched { warmup: false, .. }
        ));
    }

    #[test]
    fn warmup_replies_stay_out_of_match_counts() {
        let probe = probe(&MockClock::new(), 8).with_warmup(2);
        let mut corrupt_warm = tagged(&probe);
        corrupt_warm[40] ^= 0x10;
        let warm = tagged(&probe);
        let real = tagged(&probe);

        probe.complete(&corrupt_warm);
        probe.complete(&warm);
        probe.complete(&real);

        let counters = probe.counters();
        assert_eq!(counters.warmup, 2);
        assert_eq!(counters.matched, 1);
        assert_eq!(counters.corrupt, 0);
        assert_eq!(counters.sent, counters.warmup + counters.matched);
    }

    // =========================================================================
    // Eviction Tests
    // =========================================================================

    #[test]
    fn eviction_respects_timeout() {
        let clock = MockClock::new();
        let probe = probe(&clock, 8);
        let _ = tagged(&probe);

        clock.advance_ns(TIMEOUT_NS);
        assert_eq!(probe.evict_expired(), 0);
        clock.advance_ns(1);
        assert_eq!(probe.evict_expired(), 1);
        assert_eq!(probe.counters().lost, 1);
    }

    #[test]
    fn late_reply_after_eviction_is_duplicate() {
        let clock = MockClock::new();
        let probe = probe(&clock, 8);
        let buf = tagged(&probe);

        clock.advance_ns(2 * TIMEOUT_NS);
        probe.evict_expired();
        assert!(matches!(probe.complete(&buf), Completion::Duplicate { .. }));

        let counters = probe.counters();
        assert_eq!(counters.lost, 1);
        assert_eq!(counters.duplicates, 1);
        assert_eq!(counters.matched, 0);
    }

    #[test]
    fn eviction_scan_is_bounded() {
        let clock = MockClock::new();
        let probe = probe(&clock, 1_000);
        for _ in 0..100 {
            let _ = tagged(&probe);
        }
        clock.advance_ns(2 * TIMEOUT_NS);

        assert_eq!(probe.evict_expired(), EVICTION_SCAN_BUDGET as u64);
        assert_eq!(probe.evict_expired(), 100 - EVICTION_SCAN_BUDGET as u64);
        assert_eq!(probe.in_flight(), 0);
    }

    #[test]
    fn eviction_keeps_fresh_requests() {
        let clock = MockClock::new();
        let probe = probe(&clock, 8);
        let _old = tagged(&probe);
        clock.advance_ns(TIMEOUT_NS / 2);
        let fresh = tagged(&probe);
        clock.advance_ns(TIMEOUT_NS / 2 + 1);

        assert_eq!(probe.evict_expired(), 1);
        assert!(matches!(
            probe.complete(&fresh),
            Completion::Matched { sequence_id: 1, .. }
        ));
    }

    #[test]
    fn drained_after_sender_finishes() {
        let probe = probe(&MockClock::new(), 8);
        let buf = tagged(&probe);
        probe.finish_sending();
        assert!(!probe.is_drained());
        probe.complete(&buf);
        assert!(probe.is_drained());
    }
}
