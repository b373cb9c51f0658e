// x11q: X11 forwarding between two machines, found by word code or node id.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use x11q_core::{NodeId, Service};
use x11q_linux::config::{self, Config};
use x11q_linux::dirserver::DirectoryServer;
use x11q_linux::forward::{self, VirtualDisplay, XServer};
use x11q_linux::{
    keystore, mirror, CancelToken, HttpDirectory, Node, RendezvousServer, SessionError, Target,
    TcpNetwork,
};

const DEFAULT_PORT: u16 = 7100;

#[derive(Parser)]
#[command(name = "x11q", version, about = "X11 forwarding over NAT-traversing, code-authenticated links")]
struct Cli {
    /// Log filter when RUST_LOG is unset (e.g. debug, x11q_linux=trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Identity key file (overrides config and X11Q_IDENTITY).
    #[arg(long, global = true)]
    identity: Option<PathBuf>,

    /// Rendezvous node; repeat for several (overrides config).
    #[arg(long = "rendezvous", global = true)]
    rendezvous: Vec<SocketAddr>,

    /// Directory service URL (overrides config).
    #[arg(long, global = true)]
    directory: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print this node's id.
    Id,
    /// Serve the local X display under a fresh word code.
    Serve {
        /// Local X display to forward.
        #[arg(short, long, default_value = ":0")]
        display: String,
        /// Direct listen address.
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
    },
    /// Join a served display with its word code.
    Join {
        code: String,
        /// Virtual display number to create.
        #[arg(short, long, default_value_t = 99)]
        display: u32,
    },
    /// Direct mode server: peers dial this node id.
    Server {
        #[arg(short, long, default_value = ":0")]
        display: String,
        #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
        bind: SocketAddr,
    },
    /// Direct mode client.
    Client {
        /// NODE_ID or NODE_ID@ADDR.
        node: String,
        #[arg(short, long, default_value_t = 99)]
        display: u32,
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Share a byte stream (stdin/stdout) with one viewer.
    #[command(name = "mirror-server")]
    MirrorServer {
        #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
        bind: SocketAddr,
    },
    /// View a mirror server's stream on stdout.
    Mirror {
        /// NODE_ID or NODE_ID@ADDR.
        node: String,
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Run a rendezvous node (hole-punch coordination and relay).
    Rendezvous {
        #[arg(long)]
        bind: SocketAddr,
    },
    /// Run the directory HTTP service.
    Directory {
        #[arg(long)]
        bind: SocketAddr,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("x11q: cannot start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<SessionError>() {
            Some(SessionError::Cancelled) => ExitCode::SUCCESS,
            _ => {
                eprintln!("x11q: {e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut cfg = config::load();
    if let Some(path) = cli.identity {
        cfg.identity_path = Some(path);
    }
    if !cli.rendezvous.is_empty() {
        cfg.rendezvous = cli.rendezvous;
    }
    if let Some(url) = cli.directory {
        cfg.directory_url = Some(url);
    }

    match cli.command {
        Command::Id => {
            println!("{}", node(&cfg)?.id());
            Ok(())
        }
        Command::Serve { display, bind } => serve(&cfg, &display, bind).await,
        Command::Join { code, display } => join(&cfg, &code, display).await,
        Command::Server { display, bind } => server(&cfg, &display, bind).await,
        Command::Client {
            node: peer,
            display,
            addr,
        } => client(&cfg, &peer, addr, display).await,
        Command::MirrorServer { bind } => mirror_server(&cfg, bind).await,
        Command::Mirror { node: peer, addr } => mirror_client(&cfg, &peer, addr).await,
        Command::Rendezvous { bind } => {
            let server = RendezvousServer::bind(&TcpNetwork, bind).await?;
            let cancel = cancel_on_shutdown(CancelToken::new());
            server.run(cancel).await;
            Ok(())
        }
        Command::Directory { bind } => {
            let server = DirectoryServer::bind(bind).await?;
            let cancel = cancel_on_shutdown(CancelToken::new());
            server.run(cancel).await;
            Ok(())
        }
    }
}

fn node(cfg: &Config) -> anyhow::Result<Node> {
    let path = cfg
        .identity_path
        .clone()
        .unwrap_or_else(keystore::default_path);
    let identity = keystore::load_or_create(&path)?;
    let mut node = Node::new(identity, Arc::new(TcpNetwork))
        .with_settings(cfg.settings())
        .with_rendezvous(cfg.rendezvous.clone());
    if let Some(url) = &cfg.directory_url {
        node = node.with_directory(Arc::new(HttpDirectory::new(url.clone())?));
    }
    Ok(node)
}

fn word_code_node(cfg: &Config) -> anyhow::Result<Node> {
    if cfg.directory_url.is_none() {
        bail!("word codes need a directory: set directory_url, X11Q_DIRECTORY_URL or --directory");
    }
    node(cfg)
}

fn display_number(name: &str) -> anyhow::Result<u32> {
    forward::parse_display(name).with_context(|| format!("invalid display {name:?}"))
}

/// `NODE_ID` or `NODE_ID@ADDR`; `--addr` wins over the suffix.
fn target(peer: &str, addr: Option<SocketAddr>) -> anyhow::Result<Target> {
    let (id, suffix) = match peer.split_once('@') {
        Some((id, a)) => (id, Some(a.parse::<SocketAddr>().context("invalid address after @")?)),
        None => (peer, None),
    };
    let id: NodeId = id.parse().context("invalid node id (expected 64 hex characters)")?;
    let target = Target::new(id);
    Ok(match addr.or(suffix) {
        Some(a) => target.with_addr(a),
        None => target,
    })
}

fn cancel_on_shutdown(cancel: CancelToken) -> CancelToken {
    let c = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            tracing::warn!(error = %e, "signal handler unavailable");
            return;
        }
        tracing::info!("shutting down");
        c.cancel();
    });
    cancel
}

async fn serve(cfg: &Config, display: &str, bind: SocketAddr) -> anyhow::Result<()> {
    let server = XServer::locate(display_number(display)?)?;
    let node = word_code_node(cfg)?;
    let inbound = node.inbound(Some(bind)).await?;
    let session = node.session(Service::X11);
    cancel_on_shutdown(session.canceller());
    let serving = session.serve(inbound).await?;
    eprintln!("code: {}", serving.code());
    eprintln!("on the other machine: x11q join {}", serving.code());
    let ready = serving.wait_ready().await?;
    eprintln!("connected to {} ({})", ready.peer().short(), ready.path());
    tracing::info!(session = %ready.id(), ?server, "forwarding to local X server");
    ready
        .relay(|conn| forward::serve_display(conn, server))
        .await?;
    Ok(())
}

async fn join(cfg: &Config, code: &str, display: u32) -> anyhow::Result<()> {
    let node = word_code_node(cfg)?;
    let session = node.session(Service::X11);
    cancel_on_shutdown(session.canceller());
    let ready = session.join(code).await?;
    run_display(ready, display).await
}

async fn server(cfg: &Config, display: &str, bind: SocketAddr) -> anyhow::Result<()> {
    let server = XServer::locate(display_number(display)?)?;
    let node = node(cfg)?;
    let inbound = node.inbound(Some(bind)).await?;
    eprintln!("node id: {}", node.id());
    if let Some(addr) = inbound.listen_addr() {
        eprintln!("on the other machine: x11q client {}@<this host>:{}", node.id(), addr.port());
    }
    let session = node.session(Service::X11);
    cancel_on_shutdown(session.canceller());
    let ready = session.listen(inbound).await?;
    eprintln!("connected to {} ({})", ready.peer().short(), ready.path());
    tracing::info!(session = %ready.id(), ?server, "forwarding to local X server");
    ready
        .relay(|conn| forward::serve_display(conn, server))
        .await?;
    Ok(())
}

async fn client(
    cfg: &Config,
    peer: &str,
    addr: Option<SocketAddr>,
    display: u32,
) -> anyhow::Result<()> {
    let target = target(peer, addr)?;
    let node = node(cfg)?;
    let session = node.session(Service::X11);
    cancel_on_shutdown(session.canceller());
    let ready = session.dial(target).await?;
    run_display(ready, display).await
}

async fn run_display(ready: x11q_linux::ReadySession, display: u32) -> anyhow::Result<()> {
    let virtual_display = VirtualDisplay::bind(display)
        .await
        .with_context(|| format!("cannot bind display :{display}"))?;
    let number = virtual_display.number();
    tracing::info!(session = %ready.id(), display = number, "virtual display bound");
    eprintln!("connected to {} ({})", ready.peer().short(), ready.path());
    eprintln!("DISPLAY=:{number} ready");
    ready.relay(|conn| virtual_display.forward(conn)).await?;
    Ok(())
}

async fn mirror_server(cfg: &Config, bind: SocketAddr) -> anyhow::Result<()> {
    let node = node(cfg)?;
    let inbound = node.inbound(Some(bind)).await?;
    eprintln!("node id: {}", node.id());
    let session = node.session(Service::Mirror);
    cancel_on_shutdown(session.canceller());
    let ready = session.listen(inbound).await?;
    eprintln!("viewer {} attached", ready.peer().short());
    ready
        .relay(|conn| mirror::share(conn, tokio::io::stdin(), tokio::io::stdout()))
        .await?;
    Ok(())
}

async fn mirror_client(cfg: &Config, peer: &str, addr: Option<SocketAddr>) -> anyhow::Result<()> {
    let target = target(peer, addr)?;
    let node = node(cfg)?;
    let session = node.session(Service::Mirror);
    cancel_on_shutdown(session.canceller());
    let ready = session.dial(target).await?;
    ready
        .relay(|conn| mirror::view(conn, tokio::io::stdin(), tokio::io::stdout()))
        .await?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
