// Pod emulator daemon: radio bridge, state file, control channel.

mod bridge;
mod config;
mod control;
mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use pod_core::{Pod, SessionConfig, SessionEnd};
use tokio::io::AsyncBufRead;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, PartialEq)]
struct Args {
    version: bool,
    fresh: bool,
    state: Option<PathBuf>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut out = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => out.version = true,
            "--fresh" => out.fresh = true,
            "--state" => {
                let path = args.next().context("--state needs a path")?;
                out.state = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument {other}"),
        }
    }
    Ok(out)
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.version {
        println!("pod-linux {}", VERSION);
        return Ok(());
    }

    let mut cfg = config::load();
    if let Some(path) = args.state {
        cfg.state_file = path;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = tokio::runtime::Runtime::new()?;
    let res = rt.block_on(run(cfg, args.fresh));
    // a pending stdin read would otherwise hold the runtime open
    rt.shutdown_timeout(Duration::from_secs(1));
    res
}

async fn run(cfg: config::Config, fresh: bool) -> anyhow::Result<()> {
    let store = Arc::new(store::FileStore::new(&cfg.state_file));
    let bridge = bridge::TcpBridge::bind(cfg.bridge_port)
        .await
        .with_context(|| format!("could not listen on bridge port {}", cfg.bridge_port))?;
    info!(addr = %bridge.local_addr()?, "radio bridge listening");

    let session = SessionConfig {
        idle_timeout: Duration::from_secs(cfg.idle_timeout_secs),
    };
    let mut pod = Pod::open(store, Arc::new(bridge), session, fresh)
        .with_context(|| format!("could not open pod state {}", cfg.state_file.display()))?;
    pod.set_state_hook(Arc::new(|bytes: Vec<u8>| {
        info!(state = %String::from_utf8_lossy(&bytes), "pod state changed");
    }));

    let supervisor = pod.start_accepting();
    tokio::select! {
        res = supervisor => match res? {
            Ok(SessionEnd::Deactivated) => info!("pod was deactivated; use --fresh for a new pod"),
            Ok(end) => info!(?end, "pod stopped"),
            Err(e) => return Err(e).context("pod stopped on a fatal error"),
        },
        res = control_channel(pod.clone(), control::stdin_lines()) => {
            res.context("control channel failed")?;
        }
        res = shutdown_signal() => {
            res?;
            info!("shutting down");
        }
    }
    Ok(())
}

/// Serve setters from `input`. Only returns on a failed setter; EOF leaves the pod running.
async fn control_channel<R: AsyncBufRead + Unpin>(pod: Pod, input: R) -> anyhow::Result<()> {
    control::run_lines(&pod, input).await?;
    debug!("control input closed");
    std::future::pending().await
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
