use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clinic_live::directory::RoomDirectory;
use clinic_live::{HttpRoomDirectory, LiveConfig, Session};
use tracing::info;

#[derive(Parser)]
#[command(name = "clinic-live", about = "Clinic livestream session client")]
struct Cli {
    /// JSON config file; flags below override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Signaling hub WebSocket URL
    #[arg(long, global = true)]
    hub_url: Option<String>,

    /// REST API base URL
    #[arg(long, global = true)]
    api_base: Option<String>,

    /// Participant id sent to the hub
    #[arg(long, global = true, default_value = "cli")]
    participant: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host a stream for a clinic
    Host {
        #[arg(long)]
        clinic: String,
        /// Publish into an existing room instead of creating one
        #[arg(long)]
        room: Option<String>,
    },
    /// Watch a stream
    View {
        room: String,
        #[arg(long, default_value = "")]
        clinic: String,
    },
    /// List live rooms
    Rooms,
    /// List services a clinic can promote on stream
    Services { clinic: String },
}

fn load_config(cli: &Cli) -> Result<LiveConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => LiveConfig::from_file(path)?,
        None => LiveConfig::default(),
    };
    if let Some(url) = &cli.hub_url {
        config.hub_url = url.clone();
    }
    if let Some(base) = &cli.api_base {
        config.api_base = base.clone();
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;
    match cli.command {
        Command::Host { clinic, room } => {
            let mut session = Session::host(cli.participant, clinic);
            if let Some(room) = room {
                session = session.in_room(room);
            }
            let phase = clinic_live::run_headless(config, session).await?;
            info!("Session finished: {}", phase);
        }
        Command::View { room, clinic } => {
            let session = Session::viewer(cli.participant, clinic, room);
            let phase = clinic_live::run_headless(config, session).await?;
            info!("Session finished: {}", phase);
        }
        Command::Rooms => {
            let directory = HttpRoomDirectory::from_config(&config);
            for room in directory.list_rooms().await? {
                println!(
                    "{}\t{}\t{} watching\t{}",
                    room.room_id,
                    room.title,
                    room.viewer_count,
                    room.clinic_name.unwrap_or_default()
                );
            }
        }
        Command::Services { clinic } => {
            let directory = HttpRoomDirectory::from_config(&config);
            for service in directory.list_promotable_services(&clinic).await? {
                let price = service.price.map(|p| format!("{:.2}", p)).unwrap_or_default();
                println!("{}\t{}\t{}", service.id, service.name, price);
            }
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    clinic_live::init_tracing();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}
