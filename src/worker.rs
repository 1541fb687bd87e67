//! Writer and reader transfer loops.
//!
//! Both loops claim slots through the bounded retry contract, hand the slot
//! bytes to a payload, and return the slot to the ring. What goes into or
//! comes out of a slot is decided by the payload:
//!
//! - [`TxPayload`]: [`PatternSource`] for throughput, [`ProbeSender`] for latency
//! - [`RxPayload`]: [`PatternSink`] for throughput, [`ProbeReceiver`] for latency
//!
//! With zero-copy the payload works on the slot in place. Otherwise the
//! writer stages into a private buffer and copies in, and the reader copies
//! out and releases the slot before looking at the data.

use core::sync::atomic::{AtomicU64, Ordering};

use embedded_hal::delay::DelayNs;
use log::{debug, trace};

use crate::error::Error;
use crate::hal::backoff::{Backoff, RetryPolicy};
use crate::internal::dma::{Direction, DmaControl};
use crate::internal::register::RegisterBus;
use crate::pattern::PatternGenerator;
use crate::probe::{Completion, LatencyProbe};
use crate::stats::StatisticsAggregator;
use crate::sync::CancelToken;

// =============================================================================
// Payload Seams
// =============================================================================

/// Writer decision before claiming a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendGate {
    /// Claim and fill a slot now
    Ready,
    /// Nothing to send yet; sleep one retry interval
    Wait,
    /// Stop the writer
    Done,
}

/// Producer of outgoing buffers
pub trait TxPayload: Send {
    /// Whether to send now
    fn gate(&mut self) -> SendGate {
        SendGate::Ready
    }

    /// Fill an outgoing buffer. `sequence` is the TX ring sequence.
    fn fill(&mut self, sequence: u64, buf: &mut [u8]);

    /// The iteration was skipped after a buffer timeout
    fn skipped(&mut self) {}

    /// The writer is exiting
    fn finish(&mut self) {}
}

/// Consumer of incoming buffers
pub trait RxPayload: Send {
    /// Handle an incoming buffer. `sequence` is the RX ring sequence.
    fn consume(&mut self, sequence: u64, buf: &[u8]);

    /// Called on every claim attempt that found nothing
    fn idle(&mut self) {}

    /// Whether the reader can stop
    fn is_done(&self) -> bool {
        false
    }
}

// =============================================================================
// Counters
// =============================================================================

/// Live per-direction transfer counters
#[derive(Debug, Default)]
pub struct TransferCounters {
    buffers: AtomicU64,
    bytes: AtomicU64,
    timeouts: AtomicU64,
    mismatched_words: AtomicU64,
    corrupt_buffers: AtomicU64,
}

/// Snapshot of [`TransferCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Buffers moved
    pub buffers: u64,
    /// Bytes moved
    pub bytes: u64,
    /// Claims that exhausted the retry budget
    pub timeouts: u64,
    /// Words that failed verification
    pub mismatched_words: u64,
    /// Buffers with at least one mismatched word
    pub corrupt_buffers: u64,
}

impl TransferCounters {
    fn transferred(&self, bytes: usize) {
        self.buffers.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a buffer that failed verification
    pub fn mismatch(&self, words: usize) {
        self.mismatched_words.fetch_add(words as u64, Ordering::Relaxed);
        self.corrupt_buffers.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot
    pub fn snapshot(&self) -> TransferStats {
        TransferStats {
            buffers: self.buffers.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            mismatched_words: self.mismatched_words.load(Ordering::Relaxed),
            corrupt_buffers: self.corrupt_buffers.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Loops
// =============================================================================

/// Everything a transfer loop borrows from the run
pub struct WorkerContext<'a, B: RegisterBus> {
    /// DMA control
    pub control: &'a DmaControl<B>,
    /// Counters for this loop's direction
    pub counters: &'a TransferCounters,
    /// Run cancellation
    pub cancel: &'a CancelToken,
    /// Claim retry policy
    pub retry: RetryPolicy,
    /// Bytes per transfer
    pub transfer_size: usize,
}

/// Writer loop: claim, fill, commit until cancelled or the payload is done
pub fn run_writer<B, D, P>(ctx: &WorkerContext<'_, B>, delay: D, payload: &mut P)
where
    B: RegisterBus,
    D: DelayNs,
    P: TxPayload + ?Sized,
{
    let mut backoff = Backoff::new(delay, ctx.retry);
    let zero_copy = ctx.control.zero_copy();
    let mut staging = if zero_copy {
        Vec::new()
    } else {
        vec![0u8; ctx.transfer_size]
    };

    while !ctx.cancel.is_cancelled() {
        match payload.gate() {
            SendGate::Done => break,
            SendGate::Wait => {
                backoff.pause();
                continue;
            }
            SendGate::Ready => {}
        }

        let mut slot = match backoff.retry(Direction::Tx, ctx.cancel, || ctx.control.try_claim_write()) {
            Ok(slot) => slot,
            Err(Error::Cancelled) => break,
            Err(e) => {
                ctx.counters.timed_out();
                debug!("{e}, iteration skipped");
                payload.skipped();
                continue;
            }
        };

        let sequence = slot.sequence();
        let len = ctx.transfer_size.min(slot.capacity());
        if zero_copy {
            payload.fill(sequence, &mut slot.buffer_mut()[..len]);
        } else {
            payload.fill(sequence, &mut staging[..len]);
            slot.buffer_mut()[..len].copy_from_slice(&staging[..len]);
        }

        if ctx.control.commit(slot) {
            ctx.counters.transferred(len);
        }
    }

    payload.finish();
    trace!("writer exiting");
}

/// Reader loop: claim, consume, release until cancelled or the payload is done
pub fn run_reader<B, D, P>(ctx: &WorkerContext<'_, B>, delay: D, payload: &mut P)
where
    B: RegisterBus,
    D: DelayNs,
    P: RxPayload + ?Sized,
{
    let mut backoff = Backoff::new(delay, ctx.retry);
    let zero_copy = ctx.control.zero_copy();
    let mut staging = if zero_copy {
        Vec::new()
    } else {
        vec![0u8; ctx.transfer_size]
    };

    while !ctx.cancel.is_cancelled() && !payload.is_done() {
        // Some(None) means the payload finished while waiting
        let claimed = backoff.retry(Direction::Rx, ctx.cancel, || match ctx.control.try_claim_read() {
            Some(slot) => Some(Some(slot)),
            None => {
                payload.idle();
                payload.is_done().then_some(None)
            }
        });

        let slot = match claimed {
            Ok(Some(slot)) => slot,
            Ok(None) | Err(Error::Cancelled) => break,
            Err(e) => {
                ctx.counters.timed_out();
                trace!("{e}");
                continue;
            }
        };

        let sequence = slot.sequence();
        let len = ctx.transfer_size.min(slot.capacity());
        if zero_copy {
            payload.consume(sequence, &slot.buffer()[..len]);
            ctx.control.release(slot);
        } else {
            staging[..len].copy_from_slice(&slot.buffer()[..len]);
            ctx.control.release(slot);
            payload.consume(sequence, &staging[..len]);
        }
        ctx.counters.transferred(len);
    }

    trace!("reader exiting");
}

// =============================================================================
// Throughput Payloads
// =============================================================================

/// Streams the pattern keyed by the TX ring sequence
#[derive(Debug, Clone)]
pub struct PatternSource {
    generator: PatternGenerator,
}

impl PatternSource {
    /// Create a source
    pub fn new(generator: PatternGenerator) -> Self {
        Self { generator }
    }
}

impl TxPayload for PatternSource {
    fn fill(&mut self, sequence: u64, buf: &mut [u8]) {
        self.generator.fill(sequence, buf);
    }
}

/// Verifies the pattern keyed by the RX ring sequence
#[derive(Debug)]
pub struct PatternSink<'a> {
    generator: PatternGenerator,
    counters: &'a TransferCounters,
    verify: bool,
    verbose: bool,
}

impl<'a> PatternSink<'a> {
    /// Create a sink reporting mismatches into `counters`
    pub fn new(generator: PatternGenerator, counters: &'a TransferCounters, verify: bool, verbose: bool) -> Self {
        Self {
            generator,
            counters,
            verify,
            verbose,
        }
    }
}

impl RxPayload for PatternSink<'_> {
    fn consume(&mut self, sequence: u64, buf: &[u8]) {
        if !self.verify {
            return;
        }
        let verification = self.generator.verify(sequence, buf);
        if !verification.is_ok() {
            self.counters.mismatch(verification.mismatches);
            if self.verbose {
                verification.log(sequence);
            }
        }
    }
}

// =============================================================================
// Latency Payloads
// =============================================================================

/// Tags outgoing buffers with probes, keeping at most `max_in_flight` pending
#[derive(Debug)]
pub struct ProbeSender<'a> {
    probe: &'a LatencyProbe,
    total: u64,
    max_in_flight: usize,
    issued: u64,
}

impl<'a> ProbeSender<'a> {
    /// Send `total` probes (0 = until cancelled)
    pub fn new(probe: &'a LatencyProbe, total: u64, max_in_flight: usize) -> Self {
        Self {
            probe,
            total,
            max_in_flight: max_in_flight.max(1),
            issued: 0,
        }
    }

    /// Probes sent or skipped so far
    pub fn issued(&self) -> u64 {
        self.issued
    }
}

impl TxPayload for ProbeSender<'_> {
    fn gate(&mut self) -> SendGate {
        if self.total > 0 && self.issued >= self.total {
            return SendGate::Done;
        }
        if self.probe.in_flight() >= self.max_in_flight {
            // Waiting on replies; expire the ones that will never come
            self.probe.evict_expired();
            return SendGate::Wait;
        }
        SendGate::Ready
    }

    fn fill(&mut self, _sequence: u64, buf: &mut [u8]) {
        self.probe.tag(buf);
        self.issued += 1;
    }

    fn skipped(&mut self) {
        self.issued += 1;
    }

    fn finish(&mut self) {
        self.probe.finish_sending();
    }
}

/// Correlates replies and records samples past the warmup
#[derive(Debug)]
pub struct ProbeReceiver<'a> {
    probe: &'a LatencyProbe,
    stats: &'a StatisticsAggregator,
}

impl<'a> ProbeReceiver<'a> {
    /// Create a receiver
    pub fn new(probe: &'a LatencyProbe, stats: &'a StatisticsAggregator) -> Self {
        Self { probe, stats }
    }
}

impl RxPayload for ProbeReceiver<'_> {
    fn consume(&mut self, _sequence: u64, buf: &[u8]) {
        match self.probe.complete(buf) {
            Completion::Matched {
                sample,
                warmup: false,
                ..
            } => self.stats.record(sample),
            Completion::Matched { warmup: true, .. } => {}
            Completion::Duplicate { sequence_id } => {
                debug!("duplicate reply for request {sequence_id}");
            }
            Completion::Malformed => self.stats.record_error(),
        }
    }

    fn idle(&mut self) {
        self.probe.evict_expired();
    }

    fn is_done(&self) -> bool {
        self.probe.is_drained()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::driver::config::HistogramConfig;
    use crate::internal::dma::{BufferMapping, DmaOptions};
    use crate::internal::register::dma::{
        BUFFER_COUNT_OFFSET, BUFFER_SIZE_OFFSET, CTRL_BASE, DEVICE_IDENT, IDENT_OFFSET,
        LOOP_STATUS_OFFSET, RX_BASE, encode_loop_status,
    };
    use crate::pattern::Pattern;
    use crate::testing::{HostBuffers, MockClock, MockDelay, RecordingBus};

    const CAPACITY: usize = 4;
    const SIZE: usize = 32;

    fn setup(zero_copy: bool) -> (DmaControl<RecordingBus>, HostBuffers) {
        let bus = RecordingBus::new();
        bus.set(CTRL_BASE + IDENT_OFFSET, DEVICE_IDENT);
        bus.set(CTRL_BASE + BUFFER_COUNT_OFFSET, CAPACITY as u32);
        bus.set(CTRL_BASE + BUFFER_SIZE_OFFSET, SIZE as u32);
        let buffers = HostBuffers::new(CAPACITY, SIZE);
        let control = DmaControl::open(
            bus,
            &buffers,
            DmaOptions {
                loopback: true,
                zero_copy,
            },
        )
        .unwrap();
        control.enable_all();
        (control, buffers)
    }

    fn context<'a>(
        control: &'a DmaControl<RecordingBus>,
        counters: &'a TransferCounters,
        cancel: &'a CancelToken,
    ) -> WorkerContext<'a, RecordingBus> {
        WorkerContext {
            control,
            counters,
            cancel,
            retry: RetryPolicy::new(3, 10),
            transfer_size: SIZE,
        }
    }

    /// Sends a fixed number of pattern buffers
    struct Limited {
        remaining: u64,
        source: PatternSource,
    }

    impl TxPayload for Limited {
        fn gate(&mut self) -> SendGate {
            if self.remaining == 0 {
                SendGate::Done
            } else {
                SendGate::Ready
            }
        }

        fn fill(&mut self, sequence: u64, buf: &mut [u8]) {
            self.remaining -= 1;
            self.source.fill(sequence, buf);
        }

        fn skipped(&mut self) {
            self.remaining -= 1;
        }
    }

    /// Consumes a fixed number of buffers
    struct Counted<'a> {
        remaining: u64,
        sink: PatternSink<'a>,
    }

    impl RxPayload for Counted<'_> {
        fn consume(&mut self, sequence: u64, buf: &[u8]) {
            self.remaining -= 1;
            self.sink.consume(sequence, buf);
        }

        fn is_done(&self) -> bool {
            self.remaining == 0
        }
    }

    fn generator() -> PatternGenerator {
        PatternGenerator::new(Pattern::Sequential, 0)
    }

    fn fill_rx(buffers: &HostBuffers, count: u64, corrupt: Option<u64>) {
        let arena = buffers.arena(Direction::Rx);
        for sequence in 0..count {
            let mut slot = arena.lock(sequence as usize);
            generator().fill(sequence, &mut slot);
            if corrupt == Some(sequence) {
                slot[0] ^= 0xFF;
            }
        }
    }

    // =========================================================================
    // Writer Tests
    // =========================================================================

    #[test]
    fn writer_fills_and_commits() {
        for zero_copy in [false, true] {
            let (control, buffers) = setup(zero_copy);
            let counters = TransferCounters::default();
            let cancel = CancelToken::new();
            let mut payload = Limited {
                remaining: 3,
                source: PatternSource::new(generator()),
            };

            run_writer(&context(&control, &counters, &cancel), MockDelay::new(), &mut payload);

            let stats = counters.snapshot();
            assert_eq!(stats.buffers, 3);
            assert_eq!(stats.bytes, 3 * SIZE as u64);
            assert_eq!(control.indices(Direction::Tx).1, 3);

            let arena = buffers.arena(Direction::Tx);
            for sequence in 0..3 {
                assert!(generator().verify(sequence, &arena.lock(sequence as usize)).is_ok());
            }
        }
    }

    #[test]
    fn writer_counts_timeouts_on_full_ring() {
        let (control, _buffers) = setup(false);
        let counters = TransferCounters::default();
        let cancel = CancelToken::new();
        let mut payload = Limited {
            remaining: CAPACITY as u64 + 2,
            source: PatternSource::new(generator()),
        };

        let delay = MockDelay::new();
        run_writer(&context(&control, &counters, &cancel), delay, &mut payload);

        let stats = counters.snapshot();
        assert_eq!(stats.buffers, CAPACITY as u64);
        assert_eq!(stats.timeouts, 2);
    }

    #[test]
    fn writer_stops_when_cancelled() {
        let (control, _buffers) = setup(false);
        let counters = TransferCounters::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut payload = PatternSource::new(generator());

        run_writer(&context(&control, &counters, &cancel), MockDelay::new(), &mut payload);
        assert_eq!(counters.snapshot().buffers, 0);
    }

    // =========================================================================
    // Reader Tests
    // =========================================================================

    #[test]
    fn reader_verifies_and_releases() {
        for zero_copy in [false, true] {
            let (control, buffers) = setup(zero_copy);
            fill_rx(&buffers, 3, Some(1));
            control
                .bus()
                .set(RX_BASE + LOOP_STATUS_OFFSET, encode_loop_status(3, CAPACITY));
            control.process();

            let counters = TransferCounters::default();
            let cancel = CancelToken::new();
            let mut payload = Counted {
                remaining: 3,
                sink: PatternSink::new(generator(), &counters, true, false),
            };
            run_reader(&context(&control, &counters, &cancel), MockDelay::new(), &mut payload);

            let stats = counters.snapshot();
            assert_eq!(stats.buffers, 3);
            assert_eq!(stats.corrupt_buffers, 1);
            assert_eq!(stats.mismatched_words, 1);
            assert_eq!(control.indices(Direction::Rx).1, 3);
        }
    }

    #[test]
    fn reader_counts_timeouts_until_cancelled() {
        let (control, _buffers) = setup(false);
        let counters = TransferCounters::default();
        let cancel = CancelToken::new();

        /// Cancels the run after a few idle polls
        struct Impatient<'a> {
            polls: u32,
            cancel: &'a CancelToken,
        }
        impl RxPayload for Impatient<'_> {
            fn consume(&mut self, _: u64, _: &[u8]) {}
            fn idle(&mut self) {
                self.polls += 1;
                if self.polls == 7 {
                    self.cancel.cancel();
                }
            }
        }

        let mut payload = Impatient {
            polls: 0,
            cancel: &cancel,
        };
        run_reader(&context(&control, &counters, &cancel), MockDelay::new(), &mut payload);
        assert_eq!(counters.snapshot().timeouts, 2);
    }

    // =========================================================================
    // Probe Payload Tests
    // =========================================================================

    #[test]
    fn probe_sender_respects_in_flight_and_total() {
        let clock = MockClock::new();
        let probe = LatencyProbe::new(generator(), Arc::new(clock), 1_000_000, 4);
        let mut sender = ProbeSender::new(&probe, 2, 1);

        assert_eq!(sender.gate(), SendGate::Ready);
        let mut buf = [0u8; SIZE];
        sender.fill(0, &mut buf);
        assert_eq!(sender.gate(), SendGate::Wait);

        probe.complete(&buf);
        assert_eq!(sender.gate(), SendGate::Ready);
        sender.skipped();
        assert_eq!(sender.gate(), SendGate::Done);

        sender.finish();
        assert!(probe.is_drained());
    }

    #[test]
    fn probe_receiver_skips_warmup_and_duplicates() {
        let probe = LatencyProbe::new(generator(), Arc::new(MockClock::new()), 1_000_000, 4)
            .with_warmup(1);
        let stats = StatisticsAggregator::new(HistogramConfig::default(), 16);
        let mut receiver = ProbeReceiver::new(&probe, &stats);

        let mut warm = [0u8; SIZE];
        let mut real = [0u8; SIZE];
        probe.tag(&mut warm);
        probe.tag(&mut real);

        receiver.consume(0, &warm);
        receiver.consume(1, &real);
        receiver.consume(2, &real);

        assert_eq!(stats.count(), 1);
        assert_eq!(stats.errors(), 0);
        assert_eq!(probe.counters().duplicates, 1);
    }
}
