//! Capture Relay - 实时采集中继命令行
//!
//! - simulate: 用合成设备驱动中继，可人为制造消费者停顿和设备 xrun
//! - record: 从 ALSA 设备经中继录制原始交织数据（需要 `alsa` feature）

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use capture_relay::audio::timing::frames_for_duration;
use capture_relay::capture::synthetic::sequence_of;
use capture_relay::capture::{SyntheticConfig, SyntheticDevice};
use capture_relay::{CaptureDevice, CaptureFormat, FetchStatus, Relay, RelayConfig, SampleFormat};

/// Capture Relay - real-time audio capture relay
#[derive(Parser)]
#[command(name = "capture-relay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Do not request realtime scheduling for the capture thread
    #[arg(long, global = true)]
    no_realtime: bool,

    /// mlock the block storage
    #[arg(long, global = true)]
    lock_memory: bool,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the relay with a synthetic, real-time paced device
    Simulate(SimulateArgs),

    /// Record from an ALSA capture device through the relay
    Record(RecordArgs),
}

/// 采集格式参数（两个子命令共用）
#[derive(Args, Clone)]
struct FormatArgs {
    /// Sample rate in Hz
    #[arg(short, long, default_value = "48000")]
    rate: u32,

    /// Channel count
    #[arg(short, long, default_value = "2")]
    channels: u16,

    /// Sample format (s16le, s32le, f32le, ...)
    #[arg(short, long, default_value = "s16le")]
    format: SampleFormat,

    /// Number of period-sized blocks in the relay ring
    #[arg(short, long, default_value = "8")]
    blocks: usize,

    /// Stop after this many seconds (default: until Ctrl+C)
    #[arg(short, long)]
    seconds: Option<u64>,

    /// Write captured interleaved bytes here ("-" for stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct SimulateArgs {
    #[command(flatten)]
    format: FormatArgs,

    /// Period length in milliseconds
    #[arg(long, default_value = "10")]
    period_ms: u64,

    /// Stall the consumer after every N blocks
    #[arg(long, requires = "stall_ms")]
    stall_every: Option<u64>,

    /// Length of each consumer stall in milliseconds
    #[arg(long)]
    stall_ms: Option<u64>,

    /// Inject a device overrun every N periods
    #[arg(long)]
    xrun_every: Option<u64>,

    /// Fail the device after N periods
    #[arg(long)]
    fail_after: Option<u64>,
}

#[derive(Args)]
struct RecordArgs {
    /// ALSA device name (e.g. "default", "hw:0,0")
    #[arg(short, long, default_value = "default")]
    device: String,

    #[command(flatten)]
    format: FormatArgs,
}

/// 消费者人为停顿
#[derive(Clone, Copy)]
struct Stall {
    every: u64,
    duration: Duration,
}

/// 消费循环汇总
#[derive(Default)]
struct ConsumerSummary {
    blocks: u64,
    bytes: u64,
    overruns: u64,
    /// 按序号检测到的缺失块（仅合成设备）
    gaps: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")?;

    let relay_config = |blocks: usize| RelayConfig {
        block_count: blocks,
        realtime: !cli.no_realtime,
        lock_memory: cli.lock_memory,
        ..RelayConfig::default()
    };

    match cli.command {
        Commands::Simulate(ref args) => simulate(args, relay_config(args.format.blocks), &running),
        Commands::Record(ref args) => record(args, relay_config(args.format.blocks), &running),
    }
}

/// 合成设备模式
fn simulate(args: &SimulateArgs, config: RelayConfig, running: &AtomicBool) -> anyhow::Result<()> {
    let format = capture_format(&args.format)?;
    let period_frames = frames_for_duration(Duration::from_millis(args.period_ms), format.rate);

    let mut device_config = SyntheticConfig::new(format, period_frames);
    device_config.xrun_every = args.xrun_every;
    device_config.fail_after = args.fail_after;
    let block_size = device_config.period_bytes();

    eprintln!(
        "Simulating {} with {} frames/period ({} bytes), {} blocks",
        format, period_frames, block_size, config.block_count
    );

    let stall = match (args.stall_every, args.stall_ms) {
        (Some(every), Some(ms)) if every > 0 => Some(Stall {
            every,
            duration: Duration::from_millis(ms),
        }),
        _ => None,
    };

    let device = SyntheticDevice::new(device_config);
    let mut relay = Relay::start_with_config(device, block_size, period_frames, config)?;

    let mut sink = open_sink(args.format.output.as_deref())?;
    let result = consume(&mut relay, running, &args.format, sink.as_deref_mut(), stall, true);

    finish(relay, result)
}

#[cfg(all(feature = "alsa", target_os = "linux"))]
fn record(args: &RecordArgs, config: RelayConfig, running: &AtomicBool) -> anyhow::Result<()> {
    use capture_relay::capture::AlsaCapture;

    let format = capture_format(&args.format)?;
    let device = AlsaCapture::open(&args.device, format)?;
    let block_size = device.period_bytes();
    let frames = device.period_frames();

    eprintln!(
        "Recording {} from {} ({} frames/period, {} blocks)",
        format, args.device, frames, config.block_count
    );

    let mut relay = Relay::start_with_config(device, block_size, frames, config)?;

    let mut sink = open_sink(args.format.output.as_deref())?;
    let result = consume(&mut relay, running, &args.format, sink.as_deref_mut(), None, false);

    finish(relay, result)
}

#[cfg(not(all(feature = "alsa", target_os = "linux")))]
fn record(args: &RecordArgs, _config: RelayConfig, _running: &AtomicBool) -> anyhow::Result<()> {
    bail!(
        "cannot record from {}: built without ALSA support (enable the `alsa` feature)",
        args.device
    )
}

fn capture_format(args: &FormatArgs) -> anyhow::Result<CaptureFormat> {
    Ok(CaptureFormat::new(args.channels, args.rate, args.format)?)
}

fn open_sink(path: Option<&Path>) -> anyhow::Result<Option<Box<dyn Write>>> {
    let sink: Box<dyn Write> = match path {
        None => return Ok(None),
        Some(p) if p == Path::new("-") => Box::new(BufWriter::new(io::stdout())),
        Some(p) => {
            let file = File::create(p).with_context(|| format!("cannot create {}", p.display()))?;
            Box::new(BufWriter::new(file))
        }
    };
    Ok(Some(sink))
}

/// 消费循环：直到 Ctrl+C、超时或设备出错
fn consume<D: CaptureDevice>(
    relay: &mut Relay<D>,
    running: &AtomicBool,
    args: &FormatArgs,
    mut sink: Option<&mut (dyn Write + 'static)>,
    stall: Option<Stall>,
    check_sequence: bool,
) -> anyhow::Result<ConsumerSummary> {
    let deadline = args
        .seconds
        .map(|s| Instant::now() + Duration::from_secs(s));
    let mut block = vec![0u8; relay.block_size()];
    let mut summary = ConsumerSummary::default();
    let mut next_sequence: Option<u64> = None;

    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }

        match relay.fetch(&mut block) {
            FetchStatus::Ok => {
                summary.blocks += 1;
                summary.bytes += block.len() as u64;

                if check_sequence {
                    if let Some(seq) = sequence_of(&block) {
                        if let Some(expected) = next_sequence {
                            summary.gaps += seq.saturating_sub(expected);
                        }
                        next_sequence = Some(seq + 1);
                    }
                }

                if let Some(ref mut out) = sink {
                    out.write_all(&block).context("failed to write captured audio")?;
                }

                if let Some(stall) = stall {
                    if summary.blocks % stall.every == 0 {
                        log::info!("Stalling consumer for {:?}", stall.duration);
                        thread::sleep(stall.duration);
                    }
                }
            }
            FetchStatus::Overrun => {
                summary.overruns += 1;
                log::warn!("Relay overrun, stale blocks skipped");
            }
            FetchStatus::Error => {
                let reason = relay.fault().unwrap_or_else(|| "unknown error".to_string());
                bail!("capture failed: {}", reason);
            }
        }
    }

    if let Some(out) = sink {
        out.flush().context("failed to flush output")?;
    }

    Ok(summary)
}

/// 打印统计并停止中继
fn finish<D: CaptureDevice>(
    relay: Relay<D>,
    result: anyhow::Result<ConsumerSummary>,
) -> anyhow::Result<()> {
    let report = relay.stats();
    relay.stop();

    // 标准输出可能被录音数据占用，统计写到 stderr
    eprintln!("\n{}", report);

    let summary = result?;
    eprintln!(
        "Consumer: {} blocks ({} bytes), {} overruns, {} missing blocks",
        summary.blocks, summary.bytes, summary.overruns, summary.gaps
    );
    Ok(())
}
