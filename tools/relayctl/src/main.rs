//! Command line control for a CH340/CH341 USB relay module.

mod output;

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use output::OutputConfig;
use relay_link::{
    transport::usb, DevicePath, LinkConfig, RelayController, RelayHandle, RelayState,
    WorkerCommand, WorkerConfig, WorkerEvent,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;

/// Switch a USB relay module and read back its state
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial device of the relay (default: RELAY_DEVICE, then auto-detect)
    #[arg(short = 'D', long, global = true)]
    device: Option<String>,

    /// Baud rate (default: RELAY_BAUD, then 9600)
    #[arg(short = 'b', long, global = true)]
    baud: Option<u32>,

    /// Reply timeout in milliseconds (default: RELAY_TIMEOUT_MS, then 1000)
    #[arg(short = 't', long, global = true)]
    timeout_ms: Option<u64>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List USB serial ports and mark relay candidates
    List,
    /// Print link and relay state
    Status,
    /// Energize the relay
    On,
    /// Release the relay
    Off,
    /// Invert the relay
    Toggle,
    /// Poll the relay and print every change until Ctrl-C
    Watch {
        /// Poll interval in milliseconds (default: RELAY_POLL_MS, then 1000)
        #[arg(short = 'i', long)]
        interval_ms: Option<u64>,

        /// Reconnect automatically while the relay is unreachable
        #[arg(short = 'r', long)]
        reconnect: bool,
    },
}

impl Args {
    /// Environment first, flags on top.
    fn link_config(&self) -> Result<LinkConfig> {
        let mut config = LinkConfig::from_env();

        if let Some(device) = &self.device {
            config.device = Some(DevicePath::new(device));
        }
        if let Some(baud) = self.baud {
            if baud == 0 {
                bail!("baud rate must be positive");
            }
            config.baud = baud;
        }
        if let Some(ms) = self.timeout_ms {
            if ms == 0 {
                bail!("timeout must be positive");
            }
            config.timeout = Duration::from_millis(ms);
        }
        if let Cmd::Watch {
            interval_ms,
            reconnect,
        } = &self.command
        {
            if let Some(ms) = interval_ms {
                config.poll_interval = (*ms > 0).then(|| Duration::from_millis(*ms));
            }
            config.auto_reconnect |= *reconnect;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    relay_link::tracing::init_stdout(level);

    let output_config = OutputConfig {
        use_color: !args.no_color && std::env::var("TERM").is_ok(),
    };
    let config = args.link_config()?;

    match args.command {
        Cmd::List => list(&output_config).await,
        Cmd::Status => status(&config, &output_config).await,
        Cmd::On => switch(&config, &output_config, Switch::On).await,
        Cmd::Off => switch(&config, &output_config, Switch::Off).await,
        Cmd::Toggle => switch(&config, &output_config, Switch::Toggle).await,
        Cmd::Watch { .. } => watch(&config, &output_config).await,
    }
}

async fn list(output_config: &OutputConfig) -> Result<()> {
    let ports = tokio::task::spawn_blocking(usb::enumerate)
        .await?
        .context("Failed to enumerate USB serial ports")?;

    if ports.is_empty() {
        println!("No USB serial ports found");
        return Ok(());
    }

    let selected = usb::select_relay_port(&ports).map(|p| p.device_node.clone());
    for port in &ports {
        let is_selected = selected.as_deref() == Some(port.device_node.as_str());
        println!("{}", output::format_port(port, is_selected, output_config));
    }

    Ok(())
}

async fn connect(config: &LinkConfig) -> Result<RelayController> {
    let controller = RelayController::from_config(config);
    controller.connect().await.with_context(|| match &config.device {
        Some(device) => format!("Failed to connect to relay at {}", device),
        None => "Failed to connect to relay".to_string(),
    })?;
    Ok(controller)
}

async fn status(config: &LinkConfig, output_config: &OutputConfig) -> Result<()> {
    let controller = RelayController::from_config(config);
    let result = controller.connect().await;

    print_status(&controller, output_config);
    controller.disconnect().await;

    result.context("Relay unreachable")?;
    Ok(())
}

/// One-shot relay commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Switch {
    On,
    Off,
    Toggle,
}

impl Switch {
    /// State the acknowledgement must report; a toggle accepts either.
    fn expected_state(self) -> Option<RelayState> {
        match self {
            Switch::On => Some(RelayState::On),
            Switch::Off => Some(RelayState::Off),
            Switch::Toggle => None,
        }
    }

    async fn apply(self, controller: &RelayController) -> relay_link::Result<RelayState> {
        match self {
            Switch::On => controller.turn_on().await,
            Switch::Off => controller.turn_off().await,
            Switch::Toggle => controller.toggle().await,
        }
    }
}

async fn switch(config: &LinkConfig, output_config: &OutputConfig, action: Switch) -> Result<()> {
    let controller = connect(config).await?;

    let result = action.apply(&controller).await;

    print_status(&controller, output_config);
    controller.disconnect().await;

    let state = result.context("Relay command failed")?;
    if let Some(expected) = action.expected_state() {
        if state != expected {
            bail!("relay acknowledged {} instead of {}", state, expected);
        }
    }
    Ok(())
}

fn print_status(controller: &RelayController, output_config: &OutputConfig) {
    let device = controller.link().device_path();
    println!(
        "{}",
        output::format_status(&controller.status(), device.as_ref(), output_config)
    );
}

async fn watch(config: &LinkConfig, output_config: &OutputConfig) -> Result<()> {
    let controller = Arc::new(RelayController::from_config(config));
    let shutdown = CancellationToken::new();
    let (handle, mut events) = start_worker(&controller, config, &shutdown, output_config).await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                println!(
                    "{}",
                    output::format_event(&event, controller.current_state(), output_config)
                );
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    stop_worker(handle, &shutdown).await;
    Ok(())
}

/// Spawn the worker and ask it to connect. Without auto-reconnect a failed
/// connect is fatal, and the worker is stopped before the error returns.
async fn start_worker(
    controller: &Arc<RelayController>,
    config: &LinkConfig,
    shutdown: &CancellationToken,
    output_config: &OutputConfig,
) -> Result<(RelayHandle, mpsc::UnboundedReceiver<WorkerEvent>)> {
    let mut handle = RelayHandle::spawn(
        Arc::clone(controller),
        WorkerConfig::from_config(config),
        shutdown.clone(),
    );
    let Some(events) = handle.take_event_receiver() else {
        stop_worker(handle, shutdown).await;
        bail!("Worker event receiver already taken");
    };

    if let Err(e) = handle.execute(WorkerCommand::Connect).await {
        if !config.auto_reconnect {
            stop_worker(handle, shutdown).await;
            return Err(e).context("Failed to connect to relay");
        }
        println!("{}", output::format_failure(&e.to_string(), output_config));
    }

    Ok((handle, events))
}

async fn stop_worker(handle: RelayHandle, shutdown: &CancellationToken) {
    shutdown.cancel();
    handle.join().await;
}
