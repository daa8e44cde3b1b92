use anyhow::{Context, Result};
use clap::Parser;
use procnet::backends::capture::detect_capture_backends;
use procnet::backends::connections::detect_connection_providers;
use procnet::backends::BackendInfo;
use procnet::{InterfaceCounters, IoCounters, NetTracer, Pid, PidFilter, TracerConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use tokio::signal;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "procnet")]
#[command(version)]
#[command(about = "Network traffic of a single process, from packet capture", long_about = None)]
struct Args {
    /// Process ID or a substring of the executable name
    #[arg(required_unless_present = "list_backends")]
    target: Option<String>,

    /// Seconds between rows
    #[arg(long, value_name = "SECS", default_value_t = 1.0)]
    refresh: f64,

    /// Print rows as JSON lines
    #[arg(long)]
    json: bool,

    /// Config file (default: ~/.config/procnet/config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// List available backends
    #[arg(long)]
    list_backends: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Row<'a> {
    time: String,
    pid: Pid,
    #[serde(flatten)]
    counters: IoCounters,
    interfaces: &'a [InterfaceCounters],
}

fn print_backend_list(title: &str, backends: Vec<BackendInfo>) {
    println!("{}:", title);
    if backends.is_empty() {
        println!("  (none compiled in)");
        return;
    }
    for backend in backends {
        let status = if backend.available {
            "available"
        } else {
            "unavailable"
        };
        println!(
            "  {:20} [priority: {:?}] {} ({})",
            backend.name,
            backend.priority,
            status,
            backend.capabilities.summary()
        );
    }
}

fn print_available_backends() {
    println!("procnet {} - Available Backends\n", env!("CARGO_PKG_VERSION"));
    print_backend_list("Capture Backends", detect_capture_backends());
    println!();
    print_backend_list("Connection Providers", detect_connection_providers());
}

/// Find a process by PID, else by executable name substring (lowest PID wins)
fn resolve_target(target: &str) -> Option<(Pid, String)> {
    let sys = System::new_all();
    let name_of = |p: &sysinfo::Process| p.name().to_str().unwrap_or("unknown").to_string();

    if let Ok(pid) = target.parse::<u32>() {
        if let Some(process) = sys.process(sysinfo::Pid::from_u32(pid)) {
            return Some((pid as Pid, name_of(process)));
        }
    }

    let mut matches: Vec<(Pid, String)> = sys
        .processes()
        .iter()
        .map(|(pid, process)| (pid.as_u32() as Pid, name_of(process)))
        .filter(|(_, name)| name.contains(target))
        .collect();
    matches.sort();
    matches.into_iter().next()
}

#[cfg(unix)]
fn process_alive(pid: Pid) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    match kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Exists, owned by someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(pid: Pid) -> bool {
    let sys = System::new_all();
    sys.process(sysinfo::Pid::from_u32(pid as u32)).is_some()
}

#[cfg(unix)]
fn warn_if_unprivileged() {
    if !nix::unistd::geteuid().is_root() {
        log::warn!("Not running as root; packet capture needs root or CAP_NET_RAW");
    }
}

#[cfg(not(unix))]
fn warn_if_unprivileged() {}

fn kb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0
}

fn format_row(time: &str, counters: &IoCounters) -> String {
    format!(
        "{:<10} {:>12.2} {:>12.2}",
        time,
        kb(counters.bytes_recv),
        kb(counters.bytes_sent)
    )
}

fn print_row(tracer: &NetTracer, pid: Pid, json: bool) -> Result<()> {
    // No traffic seen yet reads as zero
    let counters = tracer.process_net_io_counters(pid).unwrap_or_default();
    let time = chrono::Local::now().format("%H:%M:%S").to_string();

    if json {
        let interfaces = tracer
            .process_net_io_counters_by_interface(pid)
            .unwrap_or_default();
        let row = Row {
            time,
            pid,
            counters,
            interfaces: &interfaces,
        };
        println!("{}", serde_json::to_string(&row).context("Failed to serialize row")?);
    } else {
        println!("{}", format_row(&time, &counters));
    }
    Ok(())
}

async fn run(args: &Args, target: &str) -> Result<()> {
    if !args.refresh.is_finite() || args.refresh <= 0.0 {
        anyhow::bail!("--refresh must be a positive number of seconds");
    }
    let refresh = Duration::from_secs_f64(args.refresh);

    let config = match &args.config {
        Some(path) => TracerConfig::load_from(path),
        None => TracerConfig::load(),
    }
    .context("Failed to load configuration")?;

    let (pid, name) = resolve_target(target)
        .with_context(|| format!("Can't find process with PID or command line '{}'", target))?;

    warn_if_unprivileged();
    println!("Network traffic of '{}' (pid={})\n", name, pid);

    let tracer = NetTracer::new(config);
    let cancel = CancellationToken::new();
    let mut errors = tracer.start(cancel.clone(), PidFilter::Pid(pid), refresh / 2);

    if !args.json {
        println!("{:<10} {:>12} {:>12}", "Time", "Rx (KB)", "Tx (KB)");
    }

    let mut ticker = interval_at(Instant::now() + refresh, refresh);
    let result = loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, stopping");
                break Ok(());
            }
            Some(e) = errors.recv() => {
                eprintln!("{}", e);
            }
            _ = ticker.tick() => {
                if !process_alive(pid) {
                    eprintln!("Process terminated");
                    break Ok(());
                }
                if let Err(e) = print_row(&tracer, pid, args.json) {
                    break Err(e);
                }
            }
        }
    };

    cancel.cancel();
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    if args.list_backends {
        print_available_backends();
        return Ok(());
    }

    match args.target.as_deref() {
        Some(target) => run(&args, target).await,
        None => anyhow::bail!("A process ID or command name is required"),
    }
}
