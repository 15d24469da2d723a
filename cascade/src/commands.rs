use std::fmt::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use cascade_core::config::TopologyConfig;
use cascade_core::lag::{lag, lag_all, render_lag};
use cascade_core::log::LogManager;
use cascade_core::log::file::FileLogManager;
use cascade_core::metrics::start_metrics_server;
use cascade_core::processor::StreamProcessor;
use cascade_core::registry::ComputationRegistry;
use cascade_core::{Error, Result};
use clap::ArgMatches;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cmdline::{
    DIR, GROUP, LIMIT, LOG_NAME, METRICS_PORT, PARTITION, QUIET, TO_END, TO_OFFSET, TOPOLOGY,
    VERBOSE,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const TERMINATION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

async fn open(args: &ArgMatches) -> Result<FileLogManager> {
    let dir = args
        .get_one::<PathBuf>(DIR)
        .ok_or_else(|| Error::Config(format!("--{DIR} is required")))?;
    FileLogManager::open(dir).await
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a String> {
    args.get_one::<String>(name)
        .ok_or_else(|| Error::Config(format!("--{name} is required")))
}

pub(crate) async fn lag_command(args: &ArgMatches) -> Result<()> {
    let manager = open(args).await?;
    let report = lag_report(
        &manager,
        args.get_one::<String>(LOG_NAME).map(String::as_str),
        args.get_flag(VERBOSE),
        args.get_flag(QUIET),
    )
    .await?;
    print!("{report}");
    Ok(())
}

async fn lag_report(
    manager: &impl LogManager,
    stream: Option<&str>,
    verbose: bool,
    quiet: bool,
) -> Result<String> {
    let lags = match stream {
        Some(stream) => vec![(stream.to_string(), lag(manager, stream).await?)],
        None => lag_all(manager).await?,
    };
    Ok(lags
        .iter()
        .map(|(stream, groups)| render_lag(stream, groups, verbose, quiet))
        .collect())
}

pub(crate) async fn cat_command(args: &ArgMatches) -> Result<()> {
    let manager = open(args).await?;
    let listing = cat(
        &manager,
        required(args, LOG_NAME)?,
        args.get_one::<u32>(PARTITION).copied(),
        args.get_one::<usize>(LIMIT).copied(),
    )
    .await?;
    print!("{listing}");
    Ok(())
}

/// One line per record: `<partition>:<offset> <key> <watermark> <flags> <payload>`.
async fn cat(
    manager: &impl LogManager,
    stream: &str,
    partition: Option<u32>,
    limit: Option<usize>,
) -> Result<String> {
    let partitions = match partition {
        Some(partition) => vec![partition],
        None => (0..manager.partitions(stream).await?).collect(),
    };
    let limit = limit.unwrap_or(usize::MAX);

    let mut listing = String::new();
    for partition in partitions {
        let mut from = 0;
        let mut printed = 0;
        while printed < limit {
            let records = manager
                .read(stream, partition, from, limit - printed, Duration::ZERO)
                .await?;
            let Some(last) = records.last() else {
                break;
            };
            from = last.offset + 1;
            printed += records.len();
            for r in records {
                let _ = writeln!(
                    listing,
                    "{}:{} {} {} {:#x} {}",
                    r.partition,
                    r.offset,
                    r.record.key_str(),
                    r.record.watermark,
                    r.record.flags.bits(),
                    String::from_utf8_lossy(&r.record.payload)
                );
            }
        }
    }
    Ok(listing)
}

pub(crate) async fn position_command(args: &ArgMatches) -> Result<()> {
    let manager = open(args).await?;
    let target = if args.get_flag(TO_END) {
        None
    } else {
        Some(
            args.get_one::<u64>(TO_OFFSET)
                .copied()
                .ok_or_else(|| Error::Config(format!("--{TO_END} or --{TO_OFFSET} is required")))?,
        )
    };
    let moved = position(
        &manager,
        required(args, LOG_NAME)?,
        required(args, GROUP)?,
        target,
    )
    .await?;
    for (partition, committed) in moved.iter().enumerate() {
        println!("{partition}: {committed}");
    }
    Ok(())
}

/// Commits `target`, or the end offset when `None`, on every partition and returns the committed
/// offsets. Commits never move backward, so a target behind the group leaves it where it is.
async fn position(
    manager: &impl LogManager,
    stream: &str,
    group: &str,
    target: Option<u64>,
) -> Result<Vec<u64>> {
    let mut committed = Vec::new();
    for partition in 0..manager.partitions(stream).await? {
        let end = manager.end_offset(stream, partition).await?;
        let offset = target.map_or(end, |t| t.min(end));
        manager.commit(stream, partition, group, offset).await?;

        let now = manager.committed(stream, partition, group).await?;
        if now > offset {
            warn!(stream, partition, group, offset, committed = now, "Group is already past the target");
        }
        info!(stream, partition, group, committed = now, "Positioned group");
        committed.push(now);
    }
    Ok(committed)
}

pub(crate) async fn run_command(args: &ArgMatches) -> Result<()> {
    let config = match args.get_one::<PathBuf>(TOPOLOGY) {
        Some(path) => TopologyConfig::from_file(path)?,
        None => TopologyConfig::from_env(std::env::vars())?,
    };
    let manager = open(args).await?;
    run(
        manager,
        &config,
        args.get_one::<u16>(METRICS_PORT).copied(),
        shutdown_signal(),
    )
    .await
}

/// Runs the topology until `shutdown` resolves or every runner ended, then stops it. Fails when
/// a partition halted.
async fn run(
    manager: FileLogManager,
    config: &TopologyConfig,
    metrics_port: Option<u16>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let registry = ComputationRegistry::with_builtins();
    let topology = config.topology(&registry)?;
    let mut processor = StreamProcessor::new(manager, topology, config.settings());
    processor.init().await?;

    let cancel = CancellationToken::new();
    let metrics_handle = metrics_port.map(|port| {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tokio::spawn(start_metrics_server(addr, processor.health(), cancel.clone()))
    });

    processor.start().await?;

    let mut shutdown = std::pin::pin!(shutdown);
    let mut interval = tokio::time::interval(TERMINATION_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = interval.tick() => {
                if processor.is_terminated() {
                    info!("Every runner ended");
                    break;
                }
            }
        }
    }

    if !processor.stop(SHUTDOWN_TIMEOUT).await {
        warn!("Some runners had to be aborted");
    }
    cancel.cancel();
    if let Some(handle) = metrics_handle {
        match handle.await {
            Ok(Err(e)) => error!(%e, "Metrics server failed"),
            Err(e) => error!(?e, "Metrics server task failed"),
            Ok(Ok(())) => {}
        }
    }

    let halted: Vec<String> = processor
        .states()
        .into_iter()
        .filter(|(_, _, state)| *state == cascade_core::runner::RunnerState::FailedHalted)
        .map(|(computation, partition, _)| format!("{computation}-{partition}"))
        .collect();
    if !halted.is_empty() {
        return Err(Error::Processing(format!(
            "halted partitions: {}",
            halted.join(", ")
        )));
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
