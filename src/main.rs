use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use fleetmesh::client::Client;
use fleetmesh::config::{self, Config};
use fleetmesh::server::Server;
use fleetmesh::servlet::Servlet;

/// §6's CLI surface: `-c <configfile>`, `-h <hostname>`, `-v`, and which
/// half of the system to run on this host (default: both).
#[derive(Parser)]
#[command(name = "fleetmesh", version, about = "Cooperative peer-to-peer replication controller")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Hostname override (defaults to this machine's hostname).
    #[arg(short = 'h', long = "hostname")]
    hostname: Option<String>,

    /// Verbose logging.
    #[arg(short = 'v', long)]
    verbose: bool,

    #[arg(value_enum, default_value = "run")]
    mode: Mode,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Run both the server (local sources) and the client (local backups).
    Run,
    /// Run only the server half — equivalent to `cluster-backup.py`'s source side.
    Server,
    /// Run only the client half — equivalent to `cb-client.py`.
    Client,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive("fleetmesh=info".parse()?)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "could not load config");
            std::process::exit(1);
        }
    };

    let hostname = cli.hostname.clone().or_else(local_hostname).unwrap_or_else(|| "localhost".to_string());

    let reload_rx = config::watch_for_changes(cli.config.clone(), RELOAD_POLL_INTERVAL);

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cfg, hostname, cli.mode, reload_rx));
    if let Err(e) = result {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(1);
    }
    Ok(())
}

const RELOAD_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Runs the server and/or client halves under `cfg` until either half
/// exits on its own or the config file changes on disk, in which case
/// §6's "restart to apply" reload fires: this function returns early so
/// the caller can decide whether to rebuild and run again.
async fn run(cfg: Config, hostname: String, mode: Mode, mut reload_rx: watch::Receiver<Arc<Config>>) -> anyhow::Result<()> {
    let port = cfg.get_int(config::GLOBAL, "PORT", 5005);
    let bind_addr = format!("0.0.0.0:{}", port);

    let run_server = matches!(mode, Mode::Run | Mode::Server);
    let run_client = matches!(mode, Mode::Run | Mode::Client);

    let server_task = if run_server {
        let servlets = build_servlets(&cfg, &hostname);
        if servlets.is_empty() {
            tracing::info!(%hostname, "no local source contexts, server half idle");
            None
        } else {
            let compressed = cfg.get_int(config::GLOBAL, "compressed", 1) != 0;
            let server = Arc::new(Server::new(servlets, compressed));
            let bind_addr = bind_addr.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = server.run(&bind_addr).await {
                    tracing::error!(error = %e, "server exited");
                }
            }))
        }
    } else {
        None
    };

    let client_task = if run_client {
        let client = Client::new(&cfg, &hostname);
        if client.is_empty() {
            tracing::info!(%hostname, "no local backup contexts, client half idle");
            None
        } else {
            Some(tokio::spawn(async move { client.run().await }))
        }
    } else {
        None
    };

    // Consume the snapshot published at watcher startup so the first
    // `changed()` only fires on a genuine edit.
    reload_rx.mark_unchanged();

    let tasks = async {
        match (server_task, client_task) {
            (None, None) => anyhow::bail!("nothing to do on host {}: no local sources or backups", hostname),
            (Some(s), Some(c)) => {
                tokio::select! {
                    r = s => { r?; }
                    r = c => { r?; }
                }
            }
            (Some(s), None) => s.await?,
            (None, Some(c)) => c.await?,
        }
        Ok(())
    };

    tokio::select! {
        r = tasks => r,
        r = reload_rx.changed() => {
            r.context("config watcher task died")?;
            tracing::warn!("config file changed; exiting so the fresh snapshot takes effect on restart");
            Ok(())
        }
    }
}

fn build_servlets(cfg: &Config, hostname: &str) -> std::collections::BTreeMap<String, Arc<Servlet>> {
    let mut servlets = std::collections::BTreeMap::new();
    for decl in cfg.local_contexts("source", hostname) {
        let root = config::path_for(&decl.address);
        let copies = cfg.get_int(&decl.context, "copies", 1).max(1) as u32;
        let rescan = cfg.get_duration(&decl.context, "rescan", std::time::Duration::from_secs(3600));
        let ignore_suffixes = cfg.get_list(&decl.context, "ignore suffix");
        let lazy_write = cfg.get_duration(&decl.context, "LAZY WRITE", std::time::Duration::from_secs(30));
        let claims_path = root.join(format!(".{}.claims.json.bz2", decl.context));
        let servlet = Servlet::new(decl.context.clone(), root, copies, rescan, ignore_suffixes, claims_path, lazy_write);
        servlets.insert(decl.context, Arc::new(servlet));
    }
    servlets
}

fn local_hostname() -> Option<String> {
    // `hostname` crate is overkill for a one-shot syscall the teacher's
    // stack doesn't already pull in; `libc::gethostname` is already a
    // dependency via `support::diskfree`.
    let mut buf = vec![0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

