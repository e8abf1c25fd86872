//! Control channel: one setter per stdin line, applied to the running pod.

use anyhow::{anyhow, bail, Context};
use pod_core::Pod;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Reservoir(f32),
    Alerts(u8),
    Fault(u8),
    Active(i64),
    Crash { before: bool },
    State,
}

/// `reservoir <units>`, `alerts <mask>`, `fault <code>`, `active <minutes>`, `crash before|after`, `state`.
pub fn parse(line: &str) -> anyhow::Result<ControlCommand> {
    let mut words = line.split_whitespace();
    let verb = words.next().ok_or_else(|| anyhow!("empty command"))?;
    let arg = words.next();
    if words.next().is_some() {
        bail!("too many arguments");
    }
    let need = || arg.ok_or_else(|| anyhow!("{verb} needs an argument"));
    let cmd = match verb {
        "reservoir" => ControlCommand::Reservoir(need()?.parse().context("reservoir units")?),
        "alerts" => ControlCommand::Alerts(parse_byte(need()?).context("alert mask")?),
        "fault" => ControlCommand::Fault(parse_byte(need()?).context("fault code")?),
        "active" => ControlCommand::Active(need()?.parse().context("active minutes")?),
        "crash" => match need()? {
            "before" => ControlCommand::Crash { before: true },
            "after" => ControlCommand::Crash { before: false },
            other => bail!("crash takes before or after, not {other}"),
        },
        "state" => ControlCommand::State,
        other => bail!("unknown command {other}"),
    };
    Ok(cmd)
}

/// Decimal, or hex with a 0x prefix.
fn parse_byte(s: &str) -> anyhow::Result<u8> {
    let v = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16)?,
        None => s.parse()?,
    };
    Ok(v)
}

pub async fn apply(pod: &Pod, cmd: ControlCommand) -> anyhow::Result<()> {
    match cmd {
        ControlCommand::Reservoir(units) => pod.set_reservoir(units).await?,
        ControlCommand::Alerts(mask) => pod.set_alerts(mask).await?,
        ControlCommand::Fault(code) => pod.set_fault(code).await?,
        ControlCommand::Active(minutes) => pod.set_active_time(minutes).await?,
        ControlCommand::Crash { before } => pod.crash_next_command(before).await,
        ControlCommand::State => {
            let json = pod.state_json().await?;
            println!("{}", String::from_utf8_lossy(&json));
        }
    }
    Ok(())
}

/// Line source for [`run_lines`] in the daemon.
pub fn stdin_lines() -> BufReader<tokio::io::Stdin> {
    BufReader::new(tokio::io::stdin())
}

/// Read lines until EOF. Setter failures are persistence failures and end the loop.
pub(crate) async fn run_lines<R: AsyncBufRead + Unpin>(pod: &Pod, input: R) -> anyhow::Result<()> {
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let cmd = match parse(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(line = %line, "bad control command: {e:#}");
                continue;
            }
        };
        info!(?cmd, "control");
        if let Err(e) = apply(pod, cmd).await {
            error!("control command failed: {e:#}");
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bridge::TcpBridge;
    use pod_core::{MemoryStore, SessionConfig};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    pub(crate) async fn pod(store: Arc<MemoryStore>) -> Pod {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let bridge = Arc::new(TcpBridge::from_listener(listener));
        Pod::open(store, bridge, SessionConfig::default(), false).unwrap()
    }

    #[tokio::test]
    async fn applies_lines_and_skips_bad_ones() {
        let store = Arc::new(MemoryStore::new());
        let pod = pod(store.clone()).await;
        run_lines(&pod, &b"reservoir 10\nprime\n\nfault 0x14\n"[..]).await.unwrap();
        let saved = store.last_saved().unwrap();
        assert_eq!(saved.reservoir, 200);
        assert_eq!(saved.fault_event, 0x14);
    }

    #[tokio::test]
    async fn save_failure_ends_the_channel() {
        let store = Arc::new(MemoryStore::new());
        let pod = pod(store.clone()).await;
        store.fail_saves(true);
        let err = run_lines(&pod, &b"reservoir 10\nfault 1\n"[..]).await.unwrap_err();
        assert!(format!("{err:#}").contains("save disabled"), "{err:#}");
        assert_eq!(store.last_saved().unwrap().fault_event, 0);
    }

    #[test]
    fn parses_setters() {
        assert_eq!(parse("reservoir 42.5").unwrap(), ControlCommand::Reservoir(42.5));
        assert_eq!(parse("alerts 0x9c").unwrap(), ControlCommand::Alerts(0x9c));
        assert_eq!(parse("  fault 20 ").unwrap(), ControlCommand::Fault(20));
        assert_eq!(parse("active 4320").unwrap(), ControlCommand::Active(4320));
        assert_eq!(parse("crash after").unwrap(), ControlCommand::Crash { before: false });
        assert_eq!(parse("state").unwrap(), ControlCommand::State);
    }

    #[test]
    fn rejects_bad_lines() {
        assert!(parse("").is_err());
        assert!(parse("reservoir").is_err());
        assert!(parse("alerts 256").is_err());
        assert!(parse("crash sideways").is_err());
        assert!(parse("fault 1 2").is_err());
        assert!(parse("prime").is_err());
    }
}
