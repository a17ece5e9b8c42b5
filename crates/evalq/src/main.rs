mod bench;
mod cli;
mod host;
mod repl;
mod run;
mod shutdown;

use std::future::Future;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use evalq_core::settings::{Settings, load_settings, save_settings, settings_path};
use evalq_engine::{Bridge, CalcEvaluator, callback_slot, serve, start_bridge};

use crate::bench::run_benchmark;
use crate::cli::{Cli, Command};
use crate::host::StdioHost;
use crate::repl::run_repl;
use crate::run::run_files;
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_ctrl_c_handler};

const EXIT_INTERRUPTED: i32 = 130;
const DEFAULT_SLOT: &str = "evalq";

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Run `work` to completion while watching for Ctrl-C. The first interrupt
/// requests a graceful stop; the second returns [`EXIT_INTERRUPTED`] at once.
async fn drive<F>(bridge: &Bridge<CalcEvaluator>, work: F) -> anyhow::Result<i32>
where
    F: Future<Output = anyhow::Result<i32>>,
{
    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown, shutdown_tx);

    tokio::pin!(work);
    let mut signals_open = true;
    loop {
        tokio::select! {
            ev_opt = shutdown_rx.recv(), if signals_open => {
                match ev_opt {
                    Some(ShutdownEvent::Graceful) => {
                        eprintln!("Stop requested: finishing queued work before exiting (press CTRL+C again to exit immediately).");
                        bridge.request_stop();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        eprintln!("Stop requested again: exiting immediately.");
                        return Ok(EXIT_INTERRUPTED);
                    }
                    None => signals_open = false,
                }
            }
            res = &mut work => return res,
        }
    }
}

/// `evalq config`: print the settings file, saving it first when any option
/// changes it. A file that fails to parse is reported, never overwritten.
fn configure(cli: &Cli, current: Settings) -> anyhow::Result<i32> {
    let updated = cli.updated_settings(current.clone());
    let path = if updated != current {
        let path = save_settings(&updated)?;
        info!(path = %path.display(), "settings saved");
        path
    } else {
        settings_path()?
    };
    println!("{}", path.display());
    println!("{}", serde_json::to_string_pretty(&updated)?);
    Ok(0)
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let loaded = load_settings();
    if let Command::Config { .. } = cli.command {
        return configure(&cli, loaded?.unwrap_or_default());
    }
    let settings = match loaded {
        Ok(settings) => settings.unwrap_or_default(),
        Err(err) => {
            warn!("failed to read settings: {err:#}");
            Settings::default()
        }
    };
    let mode = cli.context_mode(&settings);
    let config = cli.bridge_config(mode, &settings);
    info!(
        ?mode,
        queue_capacity = config.queue_capacity,
        restricted = config.context.restricted,
        "evalq {}",
        env!("CARGO_PKG_VERSION")
    );

    let handle = start_bridge(config, CalcEvaluator);
    let bridge = handle.bridge();

    match cli.command {
        Command::Repl => drive(&bridge, run_repl(handle)).await,
        Command::Run { files } => drive(&bridge, run_files(handle, files)).await,
        Command::Bench { jobs, contexts } => {
            drive(&bridge, run_benchmark(handle, jobs, contexts)).await
        }
        Command::Serve { slot, .. } => {
            let slot = slot
                .or_else(callback_slot)
                .unwrap_or_else(|| DEFAULT_SLOT.to_string());
            let mut host = StdioHost::new();
            let code = drive(&bridge, async {
                serve(&mut host, &slot, handle).await?;
                Ok::<_, anyhow::Error>(0)
            })
            .await?;
            if code == EXIT_INTERRUPTED {
                return Ok(code);
            }
            let aborted = host.finish().await?;
            Ok(if code == 0 && aborted { 1 } else { code })
        }
        Command::Config { .. } => {
            // Settings-only command; nothing was queued.
            handle.request_stop();
            handle.wait().await?;
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Stdin readers live on blocking threads; exit explicitly rather than
    // waiting for them at runtime shutdown.
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}
