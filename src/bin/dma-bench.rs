//! `dma-bench`: throughput and round-trip latency of a DMA ring transport.
//!
//! ```text
//! dma-bench --device sim --iterations 10000 --warmup 1000 --size 64
//! dma-bench --device /dev/litepcie0 --mode throughput --size 8192 --duration 10
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use log::{LevelFilter, info};

use ph_dma_bench::constants::{
    DEFAULT_BUCKET_WIDTH_US, DEFAULT_BUFFER_SIZE, DEFAULT_HISTOGRAM_BUCKETS, DEFAULT_ITERATIONS,
    DEFAULT_MAX_IN_FLIGHT, DEFAULT_MONITOR_INTERVAL_MS, DEFAULT_PATTERN_SEED,
    DEFAULT_POLL_INTERVAL_US, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_RETRY_BUDGET,
    DEFAULT_RETRY_INTERVAL_US, DEFAULT_RING_CAPACITY, DEFAULT_WARMUP,
};
use ph_dma_bench::dma::BufferMapping;
use ph_dma_bench::hal::{MonotonicClock, RetryPolicy};
use ph_dma_bench::registers::RegisterBus;
use ph_dma_bench::{
    BenchConfig, BenchContext, BenchMode, BenchReport, HistogramConfig, LoopbackDevice,
    LoopbackMode, Pattern, SimConfig,
};

/// Bytes of register space mapped from a real device
#[cfg(unix)]
const REGISTER_WINDOW: usize = 0x1000;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Device register file, or `sim` for the in-memory loopback device
    #[arg(long, value_name = "PATH|sim", default_value = "sim")]
    device: String,

    /// What to measure
    #[arg(long, value_enum, default_value_t = ModeArg::Latency)]
    mode: ModeArg,

    /// Transfer size in bytes (clamped to the device maximum)
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    size: usize,

    /// Slots per ring of the simulated device
    #[arg(long, default_value_t = DEFAULT_RING_CAPACITY)]
    ring: usize,

    /// Recorded latency iterations (0 = until cancelled)
    #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
    iterations: usize,

    /// Unrecorded leading iterations
    #[arg(long, default_value_t = DEFAULT_WARMUP)]
    warmup: usize,

    /// Payload pattern
    #[arg(long, value_enum, default_value_t = PatternArg::Sequential)]
    pattern: PatternArg,

    /// Seed of the random pattern
    #[arg(long, default_value_t = DEFAULT_PATTERN_SEED)]
    seed: u32,

    /// Interval between process steps in microseconds
    #[arg(long = "poll-us", default_value_t = DEFAULT_POLL_INTERVAL_US)]
    poll_us: u32,

    /// Claim attempts before a buffer timeout
    #[arg(long = "retry-budget", default_value_t = DEFAULT_RETRY_BUDGET)]
    retry_budget: u32,

    /// Age in milliseconds at which a request is declared lost
    #[arg(long = "timeout-ms", default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Probes in flight at once
    #[arg(long = "in-flight", default_value_t = DEFAULT_MAX_IN_FLIGHT)]
    in_flight: usize,

    /// Pin the writer to this CPU, the reader and process threads to the next two
    #[arg(long)]
    cpu: Option<usize>,

    /// Fill and verify slots in place
    #[arg(long)]
    zero_copy: bool,

    /// Loopback path
    #[arg(long, value_enum, default_value_t = LoopbackArg::Internal)]
    loopback: LoopbackArg,

    /// Skip payload verification
    #[arg(long)]
    no_verify: bool,

    /// Omit the latency histogram from the report
    #[arg(long)]
    no_histogram: bool,

    /// Latency histogram buckets before the overflow counter
    #[arg(long = "histogram-buckets", default_value_t = DEFAULT_HISTOGRAM_BUCKETS)]
    histogram_buckets: usize,

    /// Latency histogram bucket width in microseconds
    #[arg(long = "bucket-us", default_value_t = DEFAULT_BUCKET_WIDTH_US)]
    bucket_us: u64,

    /// Run length in seconds (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    duration: u64,

    /// Progress line interval in milliseconds (continuous runs default to 1000)
    #[arg(long = "monitor-ms")]
    monitor_ms: Option<u64>,

    /// Fail when this fraction of checked buffers is corrupt
    #[arg(long = "max-error-rate")]
    max_error_rate: Option<f64>,

    /// Simulated device round-trip latency in microseconds
    #[arg(long = "sim-latency-us", default_value_t = 0)]
    sim_latency_us: u64,

    /// Detach the simulated loopback cable (external loopback returns nothing)
    #[arg(long = "sim-no-cable")]
    sim_no_cable: bool,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Latency,
    Throughput,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PatternArg {
    Sequential,
    Random,
    Fixed,
    Walking,
    Alternating,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LoopbackArg {
    Internal,
    External,
}

impl From<ModeArg> for BenchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Latency => BenchMode::Latency,
            ModeArg::Throughput => BenchMode::Throughput,
        }
    }
}

impl From<PatternArg> for Pattern {
    fn from(pattern: PatternArg) -> Self {
        match pattern {
            PatternArg::Sequential => Pattern::Sequential,
            PatternArg::Random => Pattern::Random,
            PatternArg::Fixed => Pattern::Fixed,
            PatternArg::Walking => Pattern::Walking,
            PatternArg::Alternating => Pattern::Alternating,
        }
    }
}

impl From<LoopbackArg> for LoopbackMode {
    fn from(loopback: LoopbackArg) -> Self {
        match loopback {
            LoopbackArg::Internal => LoopbackMode::Internal,
            LoopbackArg::External => LoopbackMode::External,
        }
    }
}

impl Cli {
    fn config(&self) -> BenchConfig {
        let config = BenchConfig::new()
            .with_mode(self.mode.into())
            .with_buffer_size(self.size)
            .with_ring_capacity(self.ring)
            .with_iterations(self.iterations)
            .with_warmup(self.warmup)
            .with_pattern(self.pattern.into())
            .with_seed(self.seed)
            .with_poll_interval_us(self.poll_us)
            .with_retry(RetryPolicy::new(self.retry_budget, DEFAULT_RETRY_INTERVAL_US))
            .with_request_timeout(Duration::from_millis(self.timeout_ms))
            .with_max_in_flight(self.in_flight)
            .with_histogram(HistogramConfig {
                buckets: self.histogram_buckets,
                bucket_width_us: self.bucket_us,
            })
            .with_show_histogram(!self.no_histogram)
            .with_cpu_affinity(self.cpu)
            .with_zero_copy(self.zero_copy)
            .with_loopback(self.loopback.into())
            .with_verify(!self.no_verify)
            .with_verbose(self.verbose > 0)
            .with_duration((self.duration > 0).then(|| Duration::from_secs(self.duration)))
            .with_error_rate_threshold(self.max_error_rate);

        let monitor = self
            .monitor_ms
            .or_else(|| config.is_continuous().then_some(DEFAULT_MONITOR_INTERVAL_MS))
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        config.with_monitor_interval(monitor)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    // RUST_LOG overrides the flag
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn run<B, M>(config: BenchConfig, bus: B, mapping: &M) -> Result<BenchReport>
where
    B: RegisterBus,
    M: BufferMapping + ?Sized,
{
    let context = BenchContext::init(config, bus, mapping, Arc::new(MonotonicClock::new()))
        .context("failed to initialise the benchmark")?;

    let cancel = context.cancel_token();
    ctrlc::set_handler(move || cancel.cancel()).context("failed to install the Ctrl-C handler")?;

    let report = context.run()?;
    context.teardown();
    Ok(report)
}

fn run_sim(cli: &Cli, config: BenchConfig) -> Result<BenchReport> {
    let sim = SimConfig::default()
        .with_geometry(config.ring_capacity, config.buffer_size)
        .with_latency(Duration::from_micros(cli.sim_latency_us))
        .with_cable(!cli.sim_no_cable);
    let device = Arc::new(LoopbackDevice::new(sim));
    info!("using simulated loopback device");
    run(config, Arc::clone(&device), device.as_ref())
}

#[cfg(unix)]
fn run_device(cli: &Cli, config: BenchConfig) -> Result<BenchReport> {
    use ph_dma_bench::hal::{DeviceBuffers, MmioBus};

    let bus = MmioBus::open(&cli.device, REGISTER_WINDOW)
        .with_context(|| format!("failed to open {}", cli.device))?;
    let buffers = DeviceBuffers::open(&cli.device, &bus)
        .with_context(|| format!("failed to map the buffers of {}", cli.device))?;
    run(config, bus, &buffers)
}

#[cfg(not(unix))]
fn run_device(cli: &Cli, _config: BenchConfig) -> Result<BenchReport> {
    anyhow::bail!("{}: only the simulated device is supported on this platform", cli.device)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = cli.config();
    config.validate().context("invalid configuration")?;

    let threshold = config.error_rate_threshold;
    let report = if cli.device == "sim" {
        run_sim(&cli, config)?
    } else {
        run_device(&cli, config)?
    };

    println!("{report}");
    report
        .check_error_rate(threshold)
        .context("verification error rate above threshold")?;
    Ok(())
}
