use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;

use imsd::control;
use imsd::engine::{resolve_initial_profile, CredentialsEngine, Engine};
use imsd::fake_engine::FakeEngine;
use imsd::guard::HostEnvironmentGuard;
use imsd::http;
use imsd::profile::{self, ProfileStore};
use imsd::sts::CliStsAdapter;

/// Link-local address cloud SDKs probe for instance metadata.
const DEFAULT_BIND: &str = "169.254.169.254:80";
const DEFAULT_SOCKET: &str = "imsd.sock";

#[derive(Debug, Parser)]
#[clap(name = "imsd", version)]
#[clap(about = "Impersonates the cloud instance-metadata credential endpoint")]
struct Opt {
    /// Source profile to install at startup.
    #[clap(short = 'p', long = "profile")]
    profile: Option<String>,

    /// One-time code for the initial source profile, if it requires MFA.
    #[clap(long = "mfa-code")]
    mfa_code: Option<String>,

    /// Address to bind the metadata HTTP surface to.
    #[clap(long = "bind", default_value = DEFAULT_BIND)]
    bind: SocketAddr,

    /// Path of the control-plane Unix socket.
    #[clap(long = "socket")]
    socket: Option<PathBuf>,

    /// Override the AWS configuration directory (default: `~/.aws`).
    #[clap(long = "config-dir")]
    config_dir: Option<PathBuf>,

    /// Run with the fake engine (no network calls, constant placeholder credentials).
    #[clap(long = "fake")]
    fake: bool,

    /// Print discovered profiles and exit.
    #[clap(short = 'c', long = "config")]
    config: bool,

    /// Verbose logging.
    #[clap(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = run().await {
        eprintln!("Error: {err:#}");
        return std::process::ExitCode::from(1);
    }
    std::process::ExitCode::from(0)
}

async fn run() -> Result<()> {
    let opts = Opt::parse();
    init_logging(opts.verbose);

    if opts.fake {
        let engine = Arc::new(FakeEngine::new());
        return run_with_engine(engine as Arc<dyn CredentialsEngine>, None, Arc::new(ProfileStore::default()), &opts)
            .await;
    }

    let aws_dir = profile::resolve_aws_dir(opts.config_dir.as_deref())?;
    let profiles = profile::load_profiles_from_dir(&aws_dir).context("failed to load AWS profiles")?;
    if profiles.is_empty() {
        return Err(anyhow::anyhow!(
            "No AWS profiles found in {}/config or {}/credentials",
            aws_dir.display(),
            aws_dir.display()
        ));
    }

    if opts.config {
        print_config(&profiles);
        return Ok(());
    }

    let guard = Arc::new(HostEnvironmentGuard::new(aws_dir));
    if let Some(conflict) = guard.check() {
        warn!("host-environment conflict detected: {conflict}");
    }

    let initial_profile = resolve_initial_profile(opts.profile.clone());
    let sts = Arc::new(CliStsAdapter::new());
    let engine = Arc::new(Engine::new(profiles.clone(), sts, Arc::clone(&guard)));

    engine
        .set_source(&initial_profile, opts.mfa_code.as_deref())
        .await
        .with_context(|| format!("failed to establish source session for profile '{initial_profile}'"))?;

    let refresh_handle = Arc::clone(&engine);
    run_with_engine(
        engine as Arc<dyn CredentialsEngine>,
        Some(refresh_handle),
        Arc::new(profiles),
        &opts,
    )
    .await
}

/// Runs the metadata HTTP surface and control-plane socket until shutdown.
/// `refresh_handle`, when present, is the concrete [`Engine`] whose background
/// refresh task should be spawned (the fake engine has nothing to refresh).
async fn run_with_engine(
    engine: Arc<dyn CredentialsEngine>,
    refresh_handle: Option<Arc<Engine>>,
    profiles: Arc<ProfileStore>,
    opts: &Opt,
) -> Result<()> {
    let socket_path = opts.socket.clone().unwrap_or_else(default_socket_path);

    let http_listener = TcpListener::bind(opts.bind)
        .await
        .with_context(|| format!("failed to bind metadata HTTP surface on {}", opts.bind))?;
    info!("metadata HTTP surface listening on {}", opts.bind);

    let control_listener = control::bind(&socket_path)
        .with_context(|| format!("failed to bind control socket {}", socket_path.display()))?;
    info!("control-plane socket listening on {}", socket_path.display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (stop_tx, stop_rx) = watch::channel(false);

    if let Some(engine) = refresh_handle {
        engine.spawn_refresh(shutdown_rx.clone());
    }

    let http_task = tokio::spawn(http::serve(http_listener, Arc::clone(&engine), shutdown_rx.clone()));
    let control_task = tokio::spawn(control::serve(
        control_listener,
        socket_path.clone(),
        Arc::clone(&engine),
        profiles,
        stop_tx,
        shutdown_rx.clone(),
    ));

    wait_for_shutdown_signal(shutdown_tx, stop_rx).await;

    let _ = http_task.await;
    let _ = control_task.await;
    control::remove_stale_socket(&socket_path);

    Ok(())
}

/// Waits for either an OS termination signal or a control-plane `Stop` request,
/// then broadcasts shutdown to every listener.
async fn wait_for_shutdown_signal(shutdown_tx: watch::Sender<bool>, mut stop_rx: watch::Receiver<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = stop_rx.changed() => info!("received control-plane stop request, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received Ctrl-C, shutting down"),
            _ = stop_rx.changed() => info!("received control-plane stop request, shutting down"),
        }
    }
    let _ = shutdown_tx.send(true);
}

fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_SOCKET)
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn print_config(profiles: &ProfileStore) {
    let bold = Style::new().bold();
    println!("Discovered profiles:");
    for name in profiles.names() {
        let p = profiles.get(&name).expect("name came from the store itself");
        let mut badges = Vec::new();
        if name == profile::DEFAULT_PROFILE {
            badges.push("default");
        }
        if p.is_role() {
            badges.push("ROLE");
        }
        if p.requires_mfa() {
            badges.push("MFA");
        }
        if p.is_static() {
            badges.push("STATIC");
        }
        if p.protected {
            badges.push("PROTECTED");
        }
        let badge_str = badges.iter().map(|b| format!("[{b}]")).collect::<Vec<_>>().join("");
        println!("  {} {}", bold.apply_to(&name), badge_str);
    }
}
