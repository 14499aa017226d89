use std::io::Write;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rpcscope_core::crawler::{AcceptAll, ConfigCrawler};
use rpcscope_core::scan::{self, DEFAULT_FLUSH_THRESHOLD};
use rpcscope_core::{EndpointMap, EndpointScanner, Result, RpcEvent, ScanOptions, ScanStatus};

#[derive(Parser)]
#[command(name = "rpcscope")]
#[command(about = "Discover RPC interfaces in binaries and monitor live RPC calls")]
struct Cli {
    /// Increase verbosity (-v: interface-ID inquiry, -vv: principal names)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan directories for binaries carrying an RPC interface identity
    Scan {
        /// Directories to scan
        #[arg(required = true)]
        roots: Vec<PathBuf>,
        /// Endpoint dump file
        #[arg(short, long, default_value = "endpoints.txt")]
        out: PathBuf,
        /// Endpoint count that interrupts the scan
        #[arg(long, default_value_t = DEFAULT_FLUSH_THRESHOLD)]
        flush_limit: usize,
        /// Also query this server's endpoint mapper after scanning
        #[arg(long)]
        server: Option<String>,
    },
    /// Enumerate a server's endpoint mapper over every transport
    Query {
        /// Server address; empty means the local host
        #[arg(long, default_value = "")]
        server: String,
    },
    /// Capture live RPC client calls, labeled via a server registry
    Monitor {
        /// Registry of known RPC servers (JSON)
        #[arg(long)]
        config: PathBuf,
        /// Capture window in seconds; without it, capture until Enter
        #[arg(long)]
        duration: Option<u64>,
        /// Also dump captured events to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Find candidate registry files under a root
    Crawl {
        root: PathBuf,
        /// Candidate file extensions
        #[arg(long, value_delimiter = ',', default_value = "json")]
        extensions: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let result = match cli.command {
        Commands::Scan {
            roots,
            out,
            flush_limit,
            server,
        } => run_scan(&roots, &out, flush_limit, server.as_deref(), cli.verbose),
        Commands::Query { server } => run_query(&server, cli.verbose).map(|found| {
            println!("Found {} registered endpoints", found);
        }),
        Commands::Monitor {
            config,
            duration,
            out,
        } => run_monitor(&config, duration, out.as_deref()),
        Commands::Crawl { root, extensions } => run_crawl(root, extensions),
    };

    if let Err(err) = result {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

fn run_scan(
    roots: &[PathBuf],
    out: &PathBuf,
    flush_limit: usize,
    server: Option<&str>,
    verbosity: u8,
) -> Result<()> {
    let scanner = EndpointScanner::new(ScanOptions {
        flush_threshold: flush_limit,
        ..ScanOptions::default()
    });

    let mut map = EndpointMap::new();
    for root in roots {
        if scanner.scan(root, &mut map, Some(out.as_path()))? == ScanStatus::ThresholdReached {
            break;
        }
    }
    scan::save_endpoints(&map, out)?;

    for (id, path) in &map {
        println!("Endpoint: {} in {}", id, path.display());
    }
    println!("Discovered {} endpoints, dump written to {}", map.len(), out.display());

    if let Some(server) = server {
        let found = run_query(server, verbosity)?;
        println!("Found {} registered endpoints on {:?}", found, server);
    }
    Ok(())
}

#[cfg(windows)]
fn run_query(server: &str, verbosity: u8) -> Result<usize> {
    use rpcscope_core::epm::os::WindowsRpc;
    use rpcscope_core::epm::QueryEngine;

    let api = WindowsRpc;
    Ok(QueryEngine::new(&api, verbosity).query_all(server))
}

#[cfg(not(windows))]
fn run_query(_server: &str, _verbosity: u8) -> Result<usize> {
    Err(rpcscope_core::Error::Unsupported(
        "endpoint-mapper queries require the Windows RPC runtime",
    ))
}

#[cfg(windows)]
fn run_monitor(
    config: &std::path::Path,
    duration: Option<u64>,
    out: Option<&std::path::Path>,
) -> Result<()> {
    use rpcscope_core::monitor::etw::EtwBackend;
    use rpcscope_core::{CallMonitor, ServiceRegistry};

    let registry = ServiceRegistry::load(config)?;
    println!("Loaded {} RPC server configurations", registry.len());

    let mut monitor = CallMonitor::new(EtwBackend, registry);
    monitor.start()?;
    println!("Capturing RPC client calls...");

    match duration {
        Some(seconds) => std::thread::sleep(std::time::Duration::from_secs(seconds)),
        None => {
            println!("Press Enter to stop.");
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
        }
    }
    monitor.stop()?;

    let events = monitor.get_events();
    for event in &events {
        println!("{}", format_event(event));
    }
    println!("Captured {} RPC client calls", events.len());

    if let Some(out) = out {
        write_event_dump(&events, out)?;
        println!("Event dump written to {}", out.display());
    }
    Ok(())
}

#[cfg(not(windows))]
fn run_monitor(
    _config: &std::path::Path,
    _duration: Option<u64>,
    _out: Option<&std::path::Path>,
) -> Result<()> {
    Err(rpcscope_core::Error::Unsupported(
        "live call monitoring requires the Windows event-tracing facility",
    ))
}

fn run_crawl(root: PathBuf, extensions: Vec<String>) -> Result<()> {
    let crawler = ConfigCrawler::new(root, extensions);
    let found = crawler.find_files(&AcceptAll);
    for path in &found {
        println!("{}", path.display());
    }
    println!("Found {} candidate files", found.len());
    Ok(())
}

#[allow(dead_code)]
fn format_event(event: &RpcEvent) -> String {
    let mut line = format!(
        "[pid {} tid {}] {} opnum {} via {} endpoint {}",
        event.process_id,
        event.thread_id,
        event.interface_uuid,
        event.opnum,
        event.protocol,
        event.endpoint,
    );
    if let Some(file) = &event.file_name {
        line.push_str(&format!(" file {}", file));
    }
    if let Some(service) = &event.service_name {
        line.push_str(&format!(" service {}", service));
    }
    if let Some(procedure) = &event.procedure_name {
        line.push_str(&format!(" proc {}", procedure));
    }
    line
}

#[allow(dead_code)]
fn write_event_dump(events: &[RpcEvent], path: &std::path::Path) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    for event in events {
        writeln!(file, "{}", format_event(event))?;
    }
    Ok(())
}
