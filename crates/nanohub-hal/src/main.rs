//! `nanohub-ctl`: firmware management for a nanohub sensor coprocessor.
//!
//! Opens the hub character device, sends one system-app request and prints
//! the result, or streams every upstream message in `monitor` mode.
//!
//! # Usage
//!
//! ```text
//! nanohub-ctl [OPTIONS] <COMMAND>
//!
//! Commands:
//!   apps                 List installed apps
//!   memory               Show memory regions and free space
//!   load <FILE>          Upload and start an app image
//!   unload <APP_ID>      Delete an app
//!   enable <APP_ID>      Start an app
//!   disable <APP_ID>     Stop an app
//!   reboot               Restart the hub OS
//!   monitor              Print upstream messages until Ctrl-C
//!   send <APP_ID> <HEX>  Send raw bytes to a user app
//!
//! Options:
//!   --config <PATH>       Config file [default: platform config dir]
//!   --device <PATH>       Override transport.device_path
//!   --debug-level <N>     Override transport.debug_level
//!   --json                Print results as JSON
//! ```
//!
//! App ids are hexadecimal, with or without a `0x` prefix.
//!
//! # Architecture overview
//!
//! ```text
//! main (tokio)
//!  ├─ HubRuntime            NanoHub threads + SystemComm sessions
//!  │    └─ callback ──▶ unbounded channel ──▶ main
//!  └─ spawn_blocking(send)  a load may block while keys are fetched
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use nanohub_core::protocol::commands::{HubRequestType, APP_LOADED, EVT_APP_FROM_HOST};
use nanohub_core::protocol::records::{AppInfo, MemRange};
use nanohub_core::{AppId, HubMessage};
use nanohub_hal::application::link::HubRequest;
use nanohub_hal::infrastructure::runtime::HubRuntime;
use nanohub_hal::infrastructure::storage::config::{self, HubConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Nanohub firmware management tool.
#[derive(Debug, Parser)]
#[command(
    name = "nanohub-ctl",
    about = "Query and manage apps on a nanohub sensor coprocessor",
    version
)]
struct Cli {
    /// Config file to load instead of the platform default.
    #[arg(long, env = "NANOHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Hub character device, overriding the config file.
    #[arg(long, env = "NANOHUB_DEVICE")]
    device: Option<PathBuf>,

    /// Frame logging: 0 off, 1 headers, 2 payload dumps.
    #[arg(long)]
    debug_level: Option<u8>,

    /// Print results as JSON.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List installed apps.
    Apps,
    /// Show memory regions and free space.
    Memory,
    /// Upload and start an app image.
    Load { file: PathBuf },
    /// Delete an app.
    Unload {
        #[arg(value_parser = parse_app_id)]
        app_id: AppId,
    },
    /// Start an app.
    Enable {
        #[arg(value_parser = parse_app_id)]
        app_id: AppId,
    },
    /// Stop an app.
    Disable {
        #[arg(value_parser = parse_app_id)]
        app_id: AppId,
    },
    /// Restart the hub OS.
    Reboot,
    /// Print every upstream message until Ctrl-C.
    Monitor,
    /// Send raw bytes to a user app.
    Send {
        #[arg(value_parser = parse_app_id)]
        app_id: AppId,
        /// Payload as hex, e.g. `01ff` or `01:ff`.
        hex: String,
    },
}

impl Command {
    /// The request this command sends, or `None` for `monitor`.
    fn request(&self) -> anyhow::Result<Option<HubRequest>> {
        let system = |kind: HubRequestType, payload: &[u8]| {
            Some(HubRequest::system(kind.as_u32(), payload))
        };
        Ok(match self {
            Command::Apps => system(HubRequestType::QueryApps, &[]),
            Command::Memory => system(HubRequestType::QueryMemory, &[]),
            Command::Load { file } => {
                let image = std::fs::read(file)
                    .with_context(|| format!("reading app image {}", file.display()))?;
                system(HubRequestType::LoadApp, &image)
            }
            Command::Unload { app_id } => {
                system(HubRequestType::UnloadApp, &app_id.0.to_le_bytes())
            }
            Command::Enable { app_id } => {
                system(HubRequestType::AppsEnable, &app_id.0.to_le_bytes())
            }
            Command::Disable { app_id } => {
                system(HubRequestType::AppsDisable, &app_id.0.to_le_bytes())
            }
            Command::Reboot => system(HubRequestType::OsReboot, &[]),
            Command::Monitor => None,
            Command::Send { app_id, hex } => {
                if app_id.is_system() {
                    bail!("use the management commands to talk to the system app");
                }
                let payload = parse_hex(hex)?;
                Some(HubRequest::new(*app_id, EVT_APP_FROM_HOST, &payload))
            }
        })
    }
}

fn parse_app_id(s: &str) -> Result<AppId, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16)
        .map(AppId)
        .map_err(|e| format!("invalid hex app id '{s}': {e}"))
}

fn parse_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    let digits: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if digits.len() % 2 != 0 {
        bail!("hex payload has an odd number of digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

// ── Configuration and logging ─────────────────────────────────────────────────

fn load_config(cli: &Cli) -> anyhow::Result<HubConfig> {
    let mut config = match &cli.config {
        Some(path) => config::load_config_from(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => config::load_config().unwrap_or_default(),
    };
    if let Some(device) = &cli.device {
        config.transport.device_path = device.clone();
    }
    if let Some(level) = cli.debug_level {
        config.transport.debug_level = level;
    }
    Ok(config)
}

/// `RUST_LOG` wins over the config file's level.
fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

// ── Output ────────────────────────────────────────────────────────────────────

fn print_result(command: &Command, msg: &HubMessage, json_out: bool) -> anyhow::Result<()> {
    match command {
        Command::Apps => {
            let apps = AppInfo::decode_list(&msg.payload);
            if json_out {
                println!("{}", serde_json::to_string_pretty(&apps)?);
                return Ok(());
            }
            println!("{:<18} {:>10} {:>10} {:>10}", "APP ID", "VERSION", "FLASH", "RAM");
            for app in &apps {
                println!(
                    "{:<18} {:>10} {:>10} {:>10}",
                    app.app_id.to_string(),
                    format!("0x{:x}", app.version),
                    app.flash_used.map_or("-".to_string(), |v| v.to_string()),
                    app.ram_used.map_or("-".to_string(), |v| v.to_string()),
                );
            }
        }
        Command::Memory => {
            let ranges = MemRange::decode_list(&msg.payload);
            if json_out {
                println!("{}", serde_json::to_string_pretty(&ranges)?);
                return Ok(());
            }
            println!("{:<12} {:>12} {:>12}", "REGION", "TOTAL", "FREE");
            for range in &ranges {
                println!(
                    "{:<12} {:>12} {:>12}",
                    format!("{:?}", range.mem_type),
                    range.total_bytes,
                    range.free_bytes
                );
            }
        }
        _ => {
            let code = msg.result_code();
            if json_out {
                println!("{}", json!({ "result": code }));
            }
            match code {
                Some(code) if code >= APP_LOADED => {
                    if !json_out {
                        println!("ok");
                    }
                }
                Some(code) => bail!("hub reported failure ({code})"),
                None => bail!("malformed result ({} bytes)", msg.len()),
            }
        }
    }
    Ok(())
}

fn print_message(msg: &HubMessage, json_out: bool) {
    if json_out {
        println!(
            "{}",
            json!({
                "app_id": msg.app_id,
                "message_type": msg.message_type,
                "payload": msg.payload,
            })
        );
    } else {
        let hex: Vec<String> = msg.payload.iter().map(|b| format!("{b:02x}")).collect();
        println!("{} type=0x{:x} [{}]", msg.app_id, msg.message_type, hex.join(" "));
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config.logging.log_level);

    let request = cli.command.request()?;
    let wait = config.session.wait_timeout();
    info!(
        device = %config.transport.device_path.display(),
        lock = %config.transport.lock_path().display(),
        "nanohub-ctl starting"
    );

    let runtime = Arc::new(HubRuntime::from_config(&config.transport));
    let (tx, mut rx) = mpsc::unbounded_channel::<HubMessage>();
    runtime
        .subscribe(Arc::new(move |msg: &HubMessage| {
            let _ = tx.send(HubMessage::new(msg.app_id, msg.message_type, &msg.payload));
        }))
        .context("opening hub device")?;

    let outcome = match request {
        None => monitor(&mut rx, cli.json).await,
        Some(request) => run_request(&runtime, request, &cli.command, &mut rx, wait, cli.json).await,
    };

    let shutdown = Arc::clone(&runtime);
    tokio::task::spawn_blocking(move || shutdown.unsubscribe()).await?;
    outcome
}

async fn monitor(rx: &mut mpsc::UnboundedReceiver<HubMessage>, json_out: bool) -> anyhow::Result<()> {
    info!("monitoring hub messages, press Ctrl-C to stop");
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => print_message(&msg, json_out),
                None => bail!("hub link closed"),
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for Ctrl-C")?;
                info!("received Ctrl-C, stopping");
                return Ok(());
            }
        }
    }
}

async fn run_request(
    runtime: &Arc<HubRuntime>,
    request: HubRequest,
    command: &Command,
    rx: &mut mpsc::UnboundedReceiver<HubMessage>,
    wait: Duration,
    json_out: bool,
) -> anyhow::Result<()> {
    let expected = request.message_type;
    let to_system = request.app_id.is_system();

    let sender = Arc::clone(runtime);
    tokio::task::spawn_blocking(move || sender.send(&request))
        .await?
        .map_err(|e| anyhow::anyhow!("request failed ({}): {e}", e.status()))?;

    if !to_system {
        if !json_out {
            println!("sent");
        }
        return Ok(());
    }

    let reply = tokio::time::timeout(wait, async {
        while let Some(msg) = rx.recv().await {
            if msg.app_id.is_system() && msg.message_type == expected {
                return Some(msg);
            }
            debug!(app_id = %msg.app_id, message_type = msg.message_type, "ignoring message");
        }
        None
    });

    tokio::select! {
        reply = reply => match reply {
            Ok(Some(msg)) => print_result(command, &msg, json_out),
            Ok(None) => bail!("hub link closed before a result arrived"),
            Err(_) => {
                warn!(busy = ?runtime.comm().busy_keys(), "no result");
                bail!("no result within {}s", wait.as_secs())
            }
        },
        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
