use anyhow::{bail, Context, Result};
use clap::Parser;
use openpull::{Config, Manager, Severity};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "openpull")]
#[command(
    about = "Run a command and forward its output to remote readers",
    long_about = None
)]
struct Cli {
    /// Connection string; defaults to $OPENPULL_URL, then the config file
    #[arg(long)]
    url: Option<String>,

    /// Command to run with its output forwarded
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    let Some(url) = config.resolve_url(cli.url) else {
        bail!("no connection string: pass --url, set OPENPULL_URL, or configure ~/.openpull/config.toml");
    };

    let manager = Manager::connect_opts(&url, config.manager_options()).await?;
    info!(
        "connected as {} ({})",
        manager.peer_id().unwrap_or_default(),
        manager.role()
    );

    let (program, args) = cli.command.split_first().context("empty command")?;
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let stdout = child.stdout.take().context("child stdout not captured")?;
    let stderr = child.stderr.take().context("child stderr not captured")?;
    tokio::spawn(pump(manager.clone(), stdout, Severity::Info, false));
    tokio::spawn(pump(manager.clone(), stderr, Severity::Error, true));

    let status = tokio::select! {
        status = child.wait() => status.context("failed to wait for child")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, stopping child");
            let _ = child.start_kill();
            child.wait().await.context("failed to wait for child")?
        }
    };

    // Give freshly opened channels a moment to drain before teardown.
    tokio::time::sleep(config.exit_drain()).await;
    manager.disconnect();

    std::process::exit(status.code().unwrap_or(1));
}

/// Echo one child stream to our own and forward each line.
async fn pump<R>(manager: Manager, reader: R, default: Severity, to_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if to_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
        manager.submit_line(&line, default);
    }
}
