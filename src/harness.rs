//! Benchmark run orchestration.
//!
//! [`BenchContext`] owns everything a run touches: the DMA control, the
//! latency probe, the statistics and the transfer counters. Its lifecycle is
//! `init → run → teardown`:
//!
//! ```text
//!            ┌──────────────┐
//!            │ dma-process  │  process() every poll interval
//!            └──────────────┘
//!   ┌────────────┐      ┌────────────┐      ┌─────────────┐
//!   │ dma-writer │      │ dma-reader │      │ dma-monitor │ (optional)
//!   └────────────┘      └────────────┘      └─────────────┘
//!            ▲  supervised by the calling thread  ▲
//! ```
//!
//! The calling thread supervises: it forwards user cancellation, enforces
//! the run duration and notices when both workers are done. Threads are
//! joined writer and reader first, then the monitor, and the process
//! thread last since the workers depend on it making progress.

use core::fmt;
use std::sync::Arc;
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};

use embedded_hal::delay::DelayNs;
use log::{error, info, warn};

use crate::driver::config::{BenchConfig, BenchMode, LoopbackMode};
use crate::error::{Error, Result};
use crate::hal::affinity;
use crate::hal::backoff::StdDelay;
use crate::hal::clock::Clock;
use crate::internal::constants::PROBE_HEADER_SIZE;
use crate::internal::dma::{BufferMapping, ControlCounters, DmaControl, DmaOptions};
use crate::internal::register::RegisterBus;
use crate::pattern::PatternGenerator;
use crate::probe::{LatencyProbe, ProbeCounters};
use crate::stats::{LatencyReport, StatisticsAggregator};
use crate::sync::CancelToken;
use crate::worker::{
    PatternSink, PatternSource, ProbeReceiver, ProbeSender, RxPayload, TransferCounters,
    TransferStats, TxPayload, WorkerContext, run_reader, run_writer,
};

/// Sleep between supervisor checks
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(1);

/// Longest single sleep of the monitor thread
const MONITOR_TICK: Duration = Duration::from_millis(20);

// =============================================================================
// Context
// =============================================================================

/// Owner of one benchmark run
pub struct BenchContext<B: RegisterBus> {
    config: BenchConfig,
    control: DmaControl<B>,
    transfer_size: usize,
    cancel: CancelToken,
    probe: LatencyProbe,
    stats: StatisticsAggregator,
    tx: TransferCounters,
    rx: TransferCounters,
}

impl<B: RegisterBus> BenchContext<B> {
    /// Validate `config`, open the device and prepare the run.
    ///
    /// Any failure here is fatal: nothing has been started yet.
    pub fn init<M: BufferMapping + ?Sized>(
        config: BenchConfig,
        bus: B,
        mapping: &M,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let options = DmaOptions {
            loopback: config.loopback == LoopbackMode::Internal,
            zero_copy: config.zero_copy,
        };
        let control = DmaControl::open(bus, mapping, options)?;

        let transfer_size = config.effective_buffer_size(control.buffer_size());
        if transfer_size < config.buffer_size {
            warn!(
                "buffer size {} clamped to device maximum {transfer_size}",
                config.buffer_size
            );
        }
        if config.mode == BenchMode::Latency && transfer_size < PROBE_HEADER_SIZE {
            return Err(Error::device_unavailable(format!(
                "device buffers of {transfer_size} bytes cannot carry a probe header"
            )));
        }

        info!(
            "{:?} benchmark: {transfer_size} byte transfers, {} pattern, {} iterations + {} warmup",
            config.mode, config.pattern, config.iterations, config.warmup
        );

        Ok(Self {
            probe: LatencyProbe::from_config(&config, clock),
            stats: StatisticsAggregator::new(config.histogram, config.sample_window()),
            control,
            transfer_size,
            cancel: CancelToken::new(),
            tx: TransferCounters::default(),
            rx: TransferCounters::default(),
            config,
        })
    }

    /// Token that stops the run when cancelled (hand it to a signal handler)
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run configuration
    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// DMA control
    pub fn control(&self) -> &DmaControl<B> {
        &self.control
    }

    /// Bytes per transfer after clamping
    pub fn transfer_size(&self) -> usize {
        self.transfer_size
    }

    /// Latency probe
    pub fn probe(&self) -> &LatencyProbe {
        &self.probe
    }

    /// Run until the iterations complete, the duration elapses or the
    /// run is cancelled. A report is produced in every case.
    pub fn run(&self) -> Result<BenchReport> {
        let started = Instant::now();
        let deadline = self.config.duration.map(|d| started + d);
        let worker_stop = CancelToken::new();
        let service_stop = CancelToken::new();

        self.control.enable_all();
        info!("run started");

        let cancelled = thread::scope(|s| -> Result<bool> {
            let process = spawn(s, "dma-process", || {
                affinity::apply("process", self.config.cpu_affinity.map(|c| c + 2));
                self.process_loop(&service_stop);
            })?;

            let workers = match self.spawn_workers(s, &worker_stop) {
                Ok(workers) => workers,
                Err(e) => {
                    worker_stop.cancel();
                    service_stop.cancel();
                    return Err(e);
                }
            };

            let monitor = self.config.monitor_interval.and_then(|interval| {
                let stop = service_stop.clone();
                spawn(s, "dma-monitor", move || {
                    self.monitor_loop(interval, started, &stop);
                })
                    .inspect_err(|e| warn!("monitor disabled: {e}"))
                    .ok()
            });

            let cancelled = self.supervise(&workers, &worker_stop, deadline);

            for (name, handle) in ["writer", "reader"].into_iter().zip(workers) {
                if handle.join().is_err() {
                    error!("{name} thread panicked");
                }
            }
            service_stop.cancel();
            if let Some(handle) = monitor
                && handle.join().is_err()
            {
                error!("monitor thread panicked");
            }
            if process.join().is_err() {
                error!("process thread panicked");
            }
            Ok(cancelled)
        })?;

        let report = self.report(started.elapsed(), cancelled);
        info!(
            "run finished after {:.3} s{}",
            report.elapsed.as_secs_f64(),
            if cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }

    /// Stop both channels and release every buffer
    pub fn teardown(self) {
        self.control.shutdown();
        info!("teardown complete");
    }

    // =========================================================================
    // Threads
    // =========================================================================

    fn worker_context<'a>(
        &'a self,
        counters: &'a TransferCounters,
        stop: &'a CancelToken,
    ) -> WorkerContext<'a, B> {
        WorkerContext {
            control: &self.control,
            counters,
            cancel: stop,
            retry: self.config.retry,
            transfer_size: self.transfer_size,
        }
    }

    fn spawn_workers<'scope, 'env>(
        &'env self,
        s: &'scope Scope<'scope, 'env>,
        stop: &'env CancelToken,
    ) -> Result<[ScopedJoinHandle<'scope, ()>; 2]> {
        let generator = PatternGenerator::new(self.config.pattern, self.config.seed);
        let workers = match self.config.mode {
            BenchMode::Latency => [
                self.spawn_writer(
                    s,
                    stop,
                    ProbeSender::new(
                        &self.probe,
                        self.config.total_probes(),
                        self.config.max_in_flight,
                    ),
                )?,
                self.spawn_reader(s, stop, ProbeReceiver::new(&self.probe, &self.stats))?,
            ],
            BenchMode::Throughput => [
                self.spawn_writer(s, stop, PatternSource::new(generator))?,
                self.spawn_reader(
                    s,
                    stop,
                    PatternSink::new(generator, &self.rx, self.config.verify, self.config.verbose),
                )?,
            ],
        };
        Ok(workers)
    }

    fn spawn_writer<'scope, 'env, P>(
        &'env self,
        s: &'scope Scope<'scope, 'env>,
        stop: &'env CancelToken,
        mut payload: P,
    ) -> Result<ScopedJoinHandle<'scope, ()>>
    where
        P: TxPayload + 'scope,
    {
        spawn(s, "dma-writer", move || {
            affinity::apply("writer", self.config.cpu_affinity);
            run_writer(&self.worker_context(&self.tx, stop), StdDelay, &mut payload);
        })
    }

    fn spawn_reader<'scope, 'env, P>(
        &'env self,
        s: &'scope Scope<'scope, 'env>,
        stop: &'env CancelToken,
        mut payload: P,
    ) -> Result<ScopedJoinHandle<'scope, ()>>
    where
        P: RxPayload + 'scope,
    {
        spawn(s, "dma-reader", move || {
            affinity::apply("reader", self.config.cpu_affinity.map(|c| c + 1));
            run_reader(&self.worker_context(&self.rx, stop), StdDelay, &mut payload);
        })
    }

    fn process_loop(&self, stop: &CancelToken) {
        let mut delay = StdDelay;
        while !stop.is_cancelled() {
            self.control.process();
            delay.delay_us(self.config.poll_interval_us);
        }
    }

    /// Log a progress line every `interval` until stopped; returns the
    /// number of lines logged
    fn monitor_loop(&self, interval: Duration, started: Instant, stop: &CancelToken) -> u64 {
        let mut next = started + interval;
        let mut lines = 0;
        while !stop.is_cancelled() {
            let now = Instant::now();
            if now < next {
                thread::sleep((next - now).min(MONITOR_TICK));
                continue;
            }
            next += interval;
            info!("{}", self.progress(started.elapsed()));
            lines += 1;
        }
        lines
    }

    /// Wait for the workers; returns whether the user cancelled the run
    fn supervise(
        &self,
        workers: &[ScopedJoinHandle<'_, ()>],
        worker_stop: &CancelToken,
        deadline: Option<Instant>,
    ) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                info!("cancellation requested, stopping workers");
                worker_stop.cancel();
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!("run duration reached, stopping workers");
                worker_stop.cancel();
                return false;
            }
            if workers.iter().all(|w| w.is_finished()) {
                return false;
            }
            thread::sleep(SUPERVISE_INTERVAL);
        }
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// One-line progress summary
    pub fn progress(&self, elapsed: Duration) -> String {
        match self.config.mode {
            BenchMode::Latency => {
                let stats = self.stats.snapshot();
                let probe = self.probe.counters();
                format!(
                    "[{:>8.1}s] samples={} errors={} lost={} min={} mean={:.3}us max={} stddev={:.3}us",
                    elapsed.as_secs_f64(),
                    stats.count,
                    stats.errors,
                    probe.lost,
                    format_us(stats.min_ns),
                    stats.mean_ns / 1_000.0,
                    format_us(stats.max_ns),
                    stats.stddev_ns / 1_000.0,
                )
            }
            BenchMode::Throughput => {
                let tx = self.tx.snapshot();
                let rx = self.rx.snapshot();
                format!(
                    "[{:>8.1}s] TX {:.3} Gbit/s ({} buffers) RX {:.3} Gbit/s ({} buffers) errors={}",
                    elapsed.as_secs_f64(),
                    gbps(tx.bytes, elapsed),
                    tx.buffers,
                    gbps(rx.bytes, elapsed),
                    rx.buffers,
                    rx.corrupt_buffers,
                )
            }
        }
    }

    fn report(&self, elapsed: Duration, cancelled: bool) -> BenchReport {
        let latency = (self.config.mode == BenchMode::Latency).then(|| {
            let mut report = self.stats.report(self.config.iterations as u64);
            report.show_histogram = self.config.show_histogram;
            report
        });
        BenchReport {
            mode: self.config.mode,
            transfer_size: self.transfer_size,
            elapsed,
            cancelled,
            latency,
            probe: self.probe.counters(),
            tx: self.tx.snapshot(),
            rx: self.rx.snapshot(),
            control: self.control.counters(),
        }
    }
}

impl<B: RegisterBus> fmt::Debug for BenchContext<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BenchContext")
            .field("config", &self.config)
            .field("control", &self.control)
            .field("transfer_size", &self.transfer_size)
            .finish_non_exhaustive()
    }
}

fn spawn<'scope, 'env, F>(
    s: &'scope Scope<'scope, 'env>,
    name: &str,
    f: F,
) -> Result<ScopedJoinHandle<'scope, ()>>
where
    F: FnOnce() + Send + 'scope,
{
    Ok(thread::Builder::new().name(name.into()).spawn_scoped(s, f)?)
}

fn gbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / secs / 1e9
}

fn format_us(ns: Option<u64>) -> String {
    ns.map_or_else(|| "-".into(), |ns| format!("{:.3}us", ns as f64 / 1_000.0))
}

// =============================================================================
// Report
// =============================================================================

/// Everything a finished run measured
#[derive(Debug, Clone, PartialEq)]
pub struct BenchReport {
    /// Measurement mode
    pub mode: BenchMode,
    /// Bytes per transfer
    pub transfer_size: usize,
    /// Wall time from start to the workers stopping
    pub elapsed: Duration,
    /// The user cancelled the run
    pub cancelled: bool,
    /// Latency statistics (latency mode only)
    pub latency: Option<LatencyReport>,
    /// Probe correlation counters
    pub probe: ProbeCounters,
    /// Writer counters
    pub tx: TransferStats,
    /// Reader counters
    pub rx: TransferStats,
    /// DMA control counters
    pub control: ControlCounters,
}

impl BenchReport {
    /// Transmit rate in Gbit/s
    pub fn tx_gbps(&self) -> f64 {
        gbps(self.tx.bytes, self.elapsed)
    }

    /// Receive rate in Gbit/s
    pub fn rx_gbps(&self) -> f64 {
        gbps(self.rx.bytes, self.elapsed)
    }

    /// Process steps per second
    pub fn process_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.control.process_calls as f64 / secs
    }

    /// Round-trip bandwidth at the minimum latency, `2 × size / min_us` MB/s
    pub fn round_trip_bandwidth_mbps(&self) -> Option<f64> {
        let min_ns = self.latency.as_ref()?.min_ns.filter(|ns| *ns > 0)?;
        Some(2.0 * self.transfer_size as f64 / (min_ns as f64 / 1_000.0))
    }

    /// Average round trips per second
    pub fn ops_per_sec(&self) -> Option<f64> {
        let latency = self.latency.as_ref()?;
        (latency.count > 0 && latency.mean_ns > 0.0).then(|| 1e9 / latency.mean_ns)
    }

    /// `(verification errors, checked buffers)`
    pub fn verification(&self) -> (u64, u64) {
        match self.mode {
            BenchMode::Latency => (self.probe.corrupt, self.probe.matched + self.probe.corrupt),
            BenchMode::Throughput => (self.rx.corrupt_buffers, self.rx.buffers),
        }
    }

    /// Fraction of checked buffers that failed verification
    pub fn error_rate(&self) -> f64 {
        match self.verification() {
            (_, 0) => 0.0,
            (errors, checked) => errors as f64 / checked as f64,
        }
    }

    /// Escalate verification errors above `threshold` to a fatal error
    pub fn check_error_rate(&self, threshold: Option<f64>) -> Result<()> {
        let Some(threshold) = threshold else {
            return Ok(());
        };
        let (errors, samples) = self.verification();
        if self.error_rate() > threshold {
            return Err(Error::ErrorRateExceeded {
                errors,
                samples,
                threshold,
            });
        }
        Ok(())
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(latency) = &self.latency {
            write!(f, "{latency}")?;
            writeln!(f)?;
        }

        writeln!(f, "Transfer Summary:")?;
        writeln!(f, "{}", "-".repeat(40))?;
        writeln!(
            f,
            "Duration:           {:.3} s{}",
            self.elapsed.as_secs_f64(),
            if self.cancelled { " (cancelled)" } else { "" }
        )?;
        writeln!(f, "Buffer size:        {} bytes", self.transfer_size)?;
        writeln!(
            f,
            "TX:                 {} buffers, {:.3} Gbit/s",
            self.tx.buffers,
            self.tx_gbps()
        )?;
        writeln!(
            f,
            "RX:                 {} buffers, {:.3} Gbit/s",
            self.rx.buffers,
            self.rx_gbps()
        )?;
        writeln!(
            f,
            "Buffer timeouts:    TX {} / RX {}",
            self.tx.timeouts, self.rx.timeouts
        )?;
        writeln!(
            f,
            "Ring overflows:     {} ({} TX / {} RX buffers dropped)",
            self.control.overflow_events, self.control.tx_dropped, self.control.rx_dropped
        )?;
        writeln!(
            f,
            "Process steps:      {} ({:.0}/s)",
            self.control.process_calls,
            self.process_rate()
        )?;

        match self.mode {
            BenchMode::Latency => {
                let p = &self.probe;
                writeln!(
                    f,
                    "Requests:           {} sent, {} warmup, {} matched, {} corrupt, {} lost, {} duplicates",
                    p.sent, p.warmup, p.matched, p.corrupt, p.lost, p.duplicates
                )?;
                if let Some(mbps) = self.round_trip_bandwidth_mbps() {
                    writeln!(f, "Round-trip bandwidth at min latency: {mbps:.2} MB/s")?;
                }
                if let Some(ops) = self.ops_per_sec() {
                    writeln!(f, "Average operations: {ops:.0} ops/s")?;
                }
            }
            BenchMode::Throughput => {
                writeln!(
                    f,
                    "Verification:       {} corrupt buffers, {} mismatched words",
                    self.rx.corrupt_buffers, self.rx.mismatched_words
                )?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
