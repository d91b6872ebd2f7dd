use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use conn_sampler::{ConnectionSampler, SamplerSnapshot};
use dns_probe::{DnsResolver, DnsResult};
use interference::{InterferenceClassifier, InterferenceReport, StabilityReport};
use path_trace::{NetworkPath, PathTracer};
use port_scan::PortProbeResult;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod output;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json }

#[derive(Debug, Parser)]
#[command(name = "mailpath", version, about = "Mail delivery path diagnostics and connection monitoring")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./mailpath.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Output format: text or json
    #[arg(long, global = true, value_enum)]
    format: Option<OutputFormat>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Resolve addresses and MX records
    Dns {
        host: String,
        /// Per-lookup timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Trace the network path to a host
    Trace {
        host: String,
        #[arg(long)]
        max_hops: Option<u8>,
        /// Route tracing utility to run (default: traceroute)
        #[arg(long)]
        tool: Option<String>,
    },
    /// Probe mail submission ports
    Scan {
        host: String,
        /// Ports: comma/range list (e.g., 25,587 or 2520-2530). Default: 25,465,587,2525.
        #[arg(long)]
        ports: Option<String>,
        /// Timeout per port in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Output file (overwrites)
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        /// Write CSV instead of text/json when --out is provided
        #[arg(long, default_value_t = false)]
        csv: bool,
    },
    /// Look for ISP blocking, throttling and DPI on the way to a mail server
    Analyze {
        host: String,
        /// Port used for the DPI probe (default: 25)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Repeated connect measurements against one endpoint
    Stability {
        host: String,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        #[arg(long, default_value_t = 6)]
        attempts: u32,
        /// Pause between attempts in milliseconds
        #[arg(long, default_value_t = 5000)]
        interval_ms: u64,
    },
    /// Full engine pass with the connection sampler running, then a session report
    Diagnose {
        host: String,
        #[arg(long)]
        port: Option<u16>,
        /// Report file (default: logs/network_report_<unix>.txt)
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },
    /// Sample this process's connections for a while, then write a report
    Monitor {
        #[arg(long, default_value_t = 30)]
        duration_secs: u64,
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },
}

const DEFAULT_PORT: u16 = 25;
const DIAGNOSE_STABILITY_ATTEMPTS: u32 = 3;

#[derive(Debug, Serialize)]
struct Diagnosis {
    host: String,
    dns: DnsResult,
    path: NetworkPath,
    ports: Vec<PortProbeResult>,
    interference: InterferenceReport,
    stability: StabilityReport,
}

fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{}", text()),
        OutputFormat::Json => println!("{}", serde_json::to_string(value)?),
    }
    Ok(())
}

fn session_text(snapshot: &SamplerSnapshot, report: &std::path::Path) -> String {
    format!("{}\nreport: {}", snapshot.summary(), report.display())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;
    let format = cli
        .format
        .or_else(|| cfg.format.as_deref().and_then(|f| OutputFormat::from_str(f, true).ok()))
        .unwrap_or(OutputFormat::Text);

    match cli.command {
        Commands::Version => {
            println!("mailpath {} (core {})", env!("CARGO_PKG_VERSION"), mailpath_core::version());
        }
        Commands::Dns { host, timeout_ms } => {
            let limit = timeout_ms.map(Duration::from_millis).unwrap_or_else(|| cfg.dns_timeout());
            let rt = tokio::runtime::Runtime::new()?;
            let result = rt.block_on(async { DnsResolver::new(limit).resolve(&host).await });
            emit(format, &result, || output::dns_text(&result))?;
        }
        Commands::Trace { host, max_hops, tool } => {
            let mut opts = cfg.trace_options();
            if let Some(t) = tool { opts.tool = t; }
            let hops = max_hops.unwrap_or_else(|| cfg.max_hops());
            let rt = tokio::runtime::Runtime::new()?;
            let path = rt.block_on(async { PathTracer::new(opts).trace(&host, hops).await });
            emit(format, &path, || output::path_text(&path))?;
        }
        Commands::Scan { host, ports, timeout_ms, out, csv } => {
            let ports_vec = match ports.as_deref().or(cfg.scan_ports()) {
                Some(spec) => port_scan::parse_ports(spec)?,
                None => mailpath_core::SMTP_PORTS.to_vec(),
            };
            let limit = timeout_ms.map(Duration::from_millis).unwrap_or_else(|| cfg.scan_timeout());
            let rt = tokio::runtime::Runtime::new()?;
            let results = rt.block_on(async { port_scan::scan_ports(&host, &ports_vec, limit).await });
            match (out, csv) {
                (Some(path), true) => {
                    let mut wtr = csv::Writer::from_writer(std::fs::File::create(&path)?);
                    wtr.write_record(["host", "port", "open", "rtt_ms", "service"])?;
                    for r in &results {
                        wtr.write_record([
                            host.clone(),
                            r.port.to_string(),
                            r.is_open.to_string(),
                            r.rtt_ms.map(|v| format!("{:.3}", v)).unwrap_or_default(),
                            r.service.clone(),
                        ])?;
                    }
                    wtr.flush()?;
                }
                (Some(path), false) => {
                    let body = match format {
                        OutputFormat::Text => output::scan_text(&host, &results),
                        OutputFormat::Json => serde_json::to_string(&results)?,
                    };
                    std::fs::write(&path, format!("{}\n", body))?;
                }
                (None, csv) => {
                    if csv {
                        eprintln!("--csv requires --out <file>");
                    }
                    emit(format, &results, || output::scan_text(&host, &results))?;
                }
            }
        }
        Commands::Analyze { host, port } => {
            let port = port.or(cfg.analyze_port()).unwrap_or(DEFAULT_PORT);
            let classifier = InterferenceClassifier::new(PathTracer::new(cfg.trace_options()), cfg.rules())
                .with_scan(mailpath_core::SMTP_PORTS.to_vec(), cfg.scan_timeout())
                .with_max_hops(cfg.max_hops());
            let rt = tokio::runtime::Runtime::new()?;
            let report = rt.block_on(async { classifier.analyze(&host, port).await });
            emit(format, &report, || output::interference_text(&host, &report))?;
        }
        Commands::Stability { host, port, attempts, interval_ms } => {
            let rt = tokio::runtime::Runtime::new()?;
            let report = rt.block_on(async {
                interference::test_connection_stability(
                    &host,
                    port,
                    attempts,
                    Duration::from_millis(interval_ms),
                    cfg.scan_timeout(),
                )
                .await
            });
            emit(format, &report, || output::stability_text(&host, port, &report))?;
        }
        Commands::Diagnose { host, port, report } => {
            let port = port.or(cfg.analyze_port()).unwrap_or(DEFAULT_PORT);
            let sampler = ConnectionSampler::new(cfg.sampler_config());
            sampler.start()?;

            let rules = cfg.rules();
            let rt = tokio::runtime::Runtime::new()?;
            let diagnosis = rt.block_on(async {
                let dns = DnsResolver::new(cfg.dns_timeout()).resolve(&host).await;
                let path = PathTracer::new(cfg.trace_options()).trace(&host, cfg.max_hops()).await;
                let ports = port_scan::scan_ports(&host, &mailpath_core::SMTP_PORTS, cfg.scan_timeout()).await;
                let dpi = interference::dpi::probe(&host, port, rules.dpi_slow, rules.dpi_limit).await;
                let mut findings = interference::classify(&ports, &path, dpi, &rules);
                let stability = interference::test_connection_stability(
                    &host,
                    port,
                    DIAGNOSE_STABILITY_ATTEMPTS,
                    Duration::from_secs(1),
                    cfg.scan_timeout(),
                )
                .await;
                findings.record_stability(&stability);
                Diagnosis { host: host.clone(), dns, path, ports, interference: findings, stability }
            });
            drop(rt);

            sampler.stop();
            let snapshot = sampler.snapshot();
            let written = session_report::export(&snapshot, report.as_deref())?;
            info!(path = %written.display(), "diagnosis complete");
            match format {
                OutputFormat::Text => {
                    println!("{}", output::dns_text(&diagnosis.dns));
                    println!("{}", output::path_text(&diagnosis.path));
                    println!("{}", output::scan_text(&host, &diagnosis.ports));
                    println!("{}", output::interference_text(&host, &diagnosis.interference));
                    println!("{}", output::stability_text(&host, port, &diagnosis.stability));
                    println!("{}", session_text(&snapshot, &written));
                }
                OutputFormat::Json => {
                    let obj = serde_json::json!({
                        "diagnosis": diagnosis,
                        "session": snapshot,
                        "report": written,
                    });
                    println!("{}", serde_json::to_string(&obj)?);
                }
            }
        }
        Commands::Monitor { duration_secs, report } => {
            let sampler = ConnectionSampler::new(cfg.sampler_config());
            sampler.start()?;
            std::thread::sleep(Duration::from_secs(duration_secs));
            sampler.stop();
            let snapshot = sampler.snapshot();
            let written = session_report::export(&snapshot, report.as_deref())?;
            let obj = serde_json::json!({ "summary": snapshot.summary(), "stats": snapshot.stats, "report": written });
            emit(format, &obj, || session_text(&snapshot, &written))?;
        }
    }
    Ok(())
}
