use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use full_scan::FullScan;
use log::info;
use raw_transport::RawTransport;
use recon_core::{PortStatus, ResultStore, ScanOptions};
use results_sqlite::Db;
use service_probes::{RuleSet, DEFAULT_PROBES_PATH};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use web_surface::{HttpOptions, ReqwestProbe};

mod config;

const DEFAULT_PORTS: &str = "0-1000";
const DEFAULT_DB: &str = "scan.db";

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json }

#[derive(Debug, Parser)]
#[command(name = "recon", version, about = "Port state, OS and service reconnaissance of one IPv4 host")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./recon.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Result database (default: scan.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Debug logging unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Args)]
struct ScanArgs {
    /// Target host or IPv4 address
    target: String,
    /// Ports: comma/range list (e.g., 22,80,443 or 1-1024,8080). Default: 0-1000.
    #[arg(long)]
    ports: Option<String>,
    /// Wait per probe transmission in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Retransmissions after an unanswered probe
    #[arg(long)]
    retries: Option<u32>,
    /// Probes in flight at once
    #[arg(long)]
    concurrency: Option<usize>,
    /// Give up on a batch after this many milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,
    /// Clear stored results before scanning
    #[arg(long, default_value_t = false)]
    fresh: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// SYN sweep, service identification, HTTP probing and evasion probing, then the report
    Scan {
        #[command(flatten)]
        args: ScanArgs,
        /// nmap-service-probes file
        #[arg(long)]
        probes: Option<PathBuf>,
    },
    /// SYN sweep only
    Syn {
        #[command(flatten)]
        args: ScanArgs,
    },
    /// Connect to each port and match its banner against the probe rules
    VersionScan {
        #[command(flatten)]
        args: ScanArgs,
        #[arg(long)]
        probes: Option<PathBuf>,
    },
    /// Print stored results for a host
    Report {
        target: String,
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Delete every stored result
    Reset,
}

/// CLI flags over config file values over built-in defaults.
#[derive(Debug)]
struct Settings {
    ports: String,
    options: ScanOptions,
    format: OutputFormat,
    probes: PathBuf,
}

fn parse_format(s: &str) -> OutputFormat {
    match s {
        "json" => OutputFormat::Json,
        _ => OutputFormat::Text,
    }
}

fn settings(args: &ScanArgs, probes: Option<&Path>, cfg: &config::ScanConfig) -> Settings {
    let mut options = ScanOptions::default();
    if let Some(ms) = args.timeout_ms.or(cfg.timeout_ms) { options.timeout = Duration::from_millis(ms); }
    if let Some(n) = args.retries.or(cfg.retries) { options.retries = n; }
    if let Some(n) = args.concurrency.or(cfg.concurrency) { options.concurrency = n.max(1); }
    if let Some(ms) = cfg.banner_timeout_ms { options.banner_timeout = Duration::from_millis(ms); }
    if let Some(ms) = cfg.http_timeout_ms { options.http_timeout = Duration::from_millis(ms); }
    if let Some(ms) = args.deadline_ms.or(cfg.deadline_ms) { options.deadline = Some(Duration::from_millis(ms)); }
    if let Some(t) = cfg.teardown { options.teardown = t; }
    Settings {
        ports: args.ports.clone().or_else(|| cfg.ports.clone()).unwrap_or_else(|| DEFAULT_PORTS.to_string()),
        options,
        format: args.format.or_else(|| cfg.format.as_deref().map(parse_format)).unwrap_or(OutputFormat::Text),
        probes: probes
            .map(Path::to_path_buf)
            .or_else(|| cfg.probes.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROBES_PATH)),
    }
}

fn open_store(path: &Path, fresh: bool) -> Result<Arc<Db>> {
    let db = Db::open_or_create(path).with_context(|| format!("open {}", path.display()))?;
    if fresh {
        db.clear()?;
        info!("cleared stored results in {}", path.display());
    }
    Ok(Arc::new(db))
}

fn report_json(store: &dyn ResultStore, address: &str) -> Result<serde_json::Value> {
    let mut ports = Vec::new();
    for p in store.query_ports(address)? {
        let Some(r) = store.port_record(address, p.port)? else { continue };
        ports.push(serde_json::json!({
            "port": r.port,
            "protocol": r.protocol,
            "status": r.status.as_str(),
            "reason": r.reason,
            "service": r.service_name,
            "version": r.service_version,
            "banner": r.banner.map(|b| String::from_utf8_lossy(&b).trim_end().to_string()),
            "scan_time": r.scan_time,
        }));
    }
    let os: Vec<serde_json::Value> = store
        .os_guesses(address)?
        .into_iter()
        .map(|g| serde_json::json!({
            "os": g.os_name,
            "method": g.method,
            "confidence": g.confidence,
            "notes": g.notes,
        }))
        .collect();
    Ok(serde_json::json!({ "address": address, "ports": ports, "os_guesses": os }))
}

fn emit(store: &dyn ResultStore, address: &str, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{}", store.report(address)?),
        OutputFormat::Json => println!("{}", serde_json::to_string(&report_json(store, address)?)?),
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let cfg = config::load_config(cli.config.as_deref())?.unwrap_or_default().scan();
    let db_path = cli.db.clone().or_else(|| cfg.db.clone()).unwrap_or_else(|| PathBuf::from(DEFAULT_DB));

    match cli.command {
        Commands::Version => {
            println!("recon {} (core {})", env!("CARGO_PKG_VERSION"), recon_core::version());
        }
        Commands::Scan { args, probes } => {
            let s = settings(&args, probes.as_deref(), &cfg);
            let target = port_scan::resolve_target(&args.target)?;
            let ports = port_scan::parse_range(&s.ports)?;
            let rules = Arc::new(RuleSet::load(&s.probes)?);
            let store = open_store(&db_path, args.fresh)?;
            let transport = Arc::new(RawTransport::for_target(target)?);
            let http = Arc::new(ReqwestProbe::new(&HttpOptions::default())?);
            let full = FullScan::new(transport, store.clone(), http, rules, s.options);

            let rt = tokio::runtime::Runtime::new()?;
            let started = Instant::now();
            rt.block_on(full.run(target, ports))?;
            info!("scan of {} took {} ms", target, started.elapsed().as_millis());
            emit(store.as_ref(), &target.to_string(), s.format)?;
        }
        Commands::Syn { args } => {
            let s = settings(&args, None, &cfg);
            let target = port_scan::resolve_target(&args.target)?;
            let ports = port_scan::parse_range(&s.ports)?;
            let store = open_store(&db_path, args.fresh)?;
            let transport = Arc::new(RawTransport::for_target(target)?);

            let rt = tokio::runtime::Runtime::new()?;
            let batch = rt.block_on(port_scan::syn_scan(transport, store.as_ref(), target, ports, &s.options))?;
            info!(
                "{} probes: {} open, {} closed, {} filtered",
                batch.results.len(),
                batch.count(PortStatus::Open),
                batch.count(PortStatus::Closed),
                batch.count(PortStatus::Filtered)
            );
            emit(store.as_ref(), &target.to_string(), s.format)?;
        }
        Commands::VersionScan { args, probes } => {
            let s = settings(&args, probes.as_deref(), &cfg);
            let target = port_scan::resolve_target(&args.target)?;
            let ports = port_scan::parse_range(&s.ports)?;
            let rules = RuleSet::load(&s.probes)?;
            let store = open_store(&db_path, args.fresh)?;
            let transport = RawTransport::for_target(target)?;

            let rt = tokio::runtime::Runtime::new()?;
            let found = rt.block_on(service_probes::version_scan_ports(
                &transport,
                store.as_ref(),
                &rules,
                target,
                ports,
                &s.options,
            ))?;
            info!("{} services identified", found.len());
            emit(store.as_ref(), &target.to_string(), s.format)?;
        }
        Commands::Report { target, format } => {
            let address = port_scan::resolve_target(&target)?.to_string();
            let store = open_store(&db_path, false)?;
            let format = format.or_else(|| cfg.format.as_deref().map(parse_format)).unwrap_or(OutputFormat::Text);
            emit(store.as_ref(), &address, format)?;
        }
        Commands::Reset => {
            open_store(&db_path, true)?;
            println!("cleared {}", db_path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use recon_core::{HostPortWrite, OsGuess};

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_beat_config_and_config_beats_defaults() {
        let cli = Cli::try_parse_from(["recon", "scan", "10.0.0.1", "--ports", "22", "--retries", "4"]).unwrap();
        let Commands::Scan { args, probes } = cli.command else { panic!("not a scan") };
        let cfg = config::ScanConfig {
            ports: Some("80".into()),
            retries: Some(2),
            concurrency: Some(8),
            format: Some("json".into()),
            teardown: Some(false),
            ..Default::default()
        };
        let s = settings(&args, probes.as_deref(), &cfg);
        assert_eq!(s.ports, "22");
        assert_eq!(s.options.retries, 4);
        assert_eq!(s.options.concurrency, 8);
        assert!(!s.options.teardown);
        assert_eq!(s.format, OutputFormat::Json);
        assert_eq!(s.options.timeout, Duration::from_secs(2));
        assert_eq!(s.probes, PathBuf::from(DEFAULT_PROBES_PATH));

        let bare = settings(&args, None, &config::ScanConfig::default());
        assert_eq!(bare.format, OutputFormat::Text);
        assert_eq!(bare.options.deadline, None);
    }

    #[test]
    fn default_port_range_is_zero_to_a_thousand() {
        let cli = Cli::try_parse_from(["recon", "--db", "x.db", "syn", "host"]).unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("x.db")));
        let Commands::Syn { args } = cli.command else { panic!("not a syn scan") };
        let s = settings(&args, None, &config::ScanConfig::default());
        assert_eq!(port_scan::parse_range(&s.ports).unwrap().iter().count(), 1001);
    }

    #[test]
    fn json_report_lists_every_port_and_guess() {
        let db = Db::open_in_memory().unwrap();
        let host = db.upsert_host("10.0.0.1", None).unwrap();
        let port = db.upsert_port(22, "tcp").unwrap();
        let svc = db.upsert_service("ssh", Some("OpenSSH 8.9")).unwrap();
        db.upsert_host_port(&HostPortWrite {
            host_id: host,
            port_id: port,
            status: PortStatus::Open,
            reason: "tcp-conn-scan",
            service_id: Some(svc),
            banner: Some(b"SSH-2.0-OpenSSH_8.9\r\n".as_slice()),
        })
        .unwrap();
        db.upsert_os_guess(host, &OsGuess {
            os_name: "Linux/Unix".into(),
            method: "ttl-guess".into(),
            confidence: Some("medium".into()),
            notes: "Observed TTL: 64".into(),
        })
        .unwrap();

        let v = report_json(&db, "10.0.0.1").unwrap();
        assert_eq!(v["ports"][0]["status"], "open");
        assert_eq!(v["ports"][0]["version"], "OpenSSH 8.9");
        assert_eq!(v["ports"][0]["banner"], "SSH-2.0-OpenSSH_8.9");
        assert_eq!(v["os_guesses"][0]["os"], "Linux/Unix");
    }
}
