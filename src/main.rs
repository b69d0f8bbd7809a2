use anyhow::Context;
use clap::{Parser, Subcommand};
use dorm_door_ble::domain::models::{AppEvent, CommandEvent, MessageSeverity};
use dorm_door_ble::domain::settings::SettingsService;
use dorm_door_ble::infrastructure::bluetooth::btle::BtleplugRadio;
use dorm_door_ble::infrastructure::bluetooth::protocol::{self, CommandCode, CommandParams};
use dorm_door_ble::infrastructure::logging::init_logger;
use dorm_door_ble::{CommandOutcome, DoorSession, RoomIdentity};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "dorm_door_ble", version, about = "Open dormitory door locks over BLE")]
struct Cli {
    /// Settings file; defaults to the per-user config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overriding the settings file (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List locks advertising nearby
    Scan,
    /// Open the room door lock
    OpenRoom {
        #[arg(long)]
        building: String,
        #[arg(long)]
        room: String,
        /// Lock identity, preferred over building and room
        #[arg(long)]
        device_id: Option<String>,
    },
    /// Open the building entrance door
    OpenEntrance {
        #[arg(long)]
        building: String,
    },
    /// Send any command to a lock by exact name
    Send {
        #[arg(long)]
        device: String,
        /// Command code in hex, e.g. 1C or 0x1C
        #[arg(long, value_parser = parse_code)]
        code: u8,
        #[arg(long, default_value = "")]
        order: String,
        #[arg(long, default_value = "")]
        number: String,
        #[arg(long, default_value = "")]
        cycle: String,
    },
}

fn parse_code(value: &str) -> Result<u8, String> {
    let digits = value
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("invalid command code {}: {}", value, e))
}

async fn log_events(mut events: mpsc::UnboundedReceiver<AppEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::DeviceFound(device) => info!(
                "Found {} [{}] rssi {:?}",
                device.name, device.id, device.signal_strength
            ),
            AppEvent::LogMessage(msg) => match msg.severity {
                MessageSeverity::Error => error!("{}", msg.message),
                MessageSeverity::Warning => warn!("{}", msg.message),
                MessageSeverity::Info | MessageSeverity::Success => info!("{}", msg.message),
            },
            AppEvent::Command(CommandEvent::Progress { .. }) => {}
            other => debug!("{:?}", other),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings_service = match cli.config {
        Some(path) => SettingsService::with_path(path),
        None => SettingsService::new()?,
    };
    let settings = settings_service.get().clone();
    let _guard = init_logger(&settings.log_settings, cli.log_level.as_deref())?;
    info!("Settings: {}", settings_service.path().display());

    let (event_sender, event_receiver) = mpsc::unbounded_channel();
    tokio::spawn(log_events(event_receiver));

    let radio = BtleplugRadio::new()
        .await
        .context("Bluetooth adapter unavailable")?;
    let session = DoorSession::from_settings(Arc::new(radio), &settings, event_sender)?;
    let entrance_grace = Duration::from_millis(settings.timings.entrance_disconnect_ms);

    let outcome = match cli.command {
        Command::Scan => {
            session.link().initialize().await?;
            session.link().start_scan().await?;
            tokio::time::sleep(Duration::from_millis(settings.timings.scan_timeout_ms)).await;
            session.dispose().await;
            return Ok(());
        }
        Command::OpenRoom {
            building,
            room,
            device_id,
        } => {
            let mut identity = RoomIdentity::new(building, room);
            identity.device_id = device_id;
            session.open_room_door(&identity).await
        }
        Command::OpenEntrance { building } => {
            let result = session
                .open_entrance_door(&RoomIdentity::new(building, ""))
                .await;
            tokio::time::sleep(entrance_grace).await;
            result
        }
        Command::Send {
            device,
            code,
            order,
            number,
            cycle,
        } => {
            let params = if order.is_empty() && number.is_empty() && cycle.is_empty() {
                None
            } else {
                Some(CommandParams {
                    order,
                    number_sequence: number,
                    cycle,
                })
            };
            let description = CommandCode::from_u8(code)
                .map(|c| c.description())
                .unwrap_or("unknown command");
            info!("Sending {} ({})", protocol::command_name(code), description);
            let result = session.send_to(&device, code, params).await;
            if code == CommandCode::EntranceOpen.as_u8() {
                tokio::time::sleep(entrance_grace).await;
            }
            result
        }
    };

    session.dispose().await;

    match outcome {
        Ok(outcome) if outcome.is_success() => {
            info!("Done: {}", outcome);
            Ok(())
        }
        Ok(CommandOutcome::TimedOut) => anyhow::bail!("The lock did not answer"),
        Ok(outcome) => anyhow::bail!("The lock refused the command: {}", outcome),
        Err(e) => Err(e.into()),
    }
}
