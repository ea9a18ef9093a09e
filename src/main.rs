mod client;
mod config;
mod error;
mod game;
mod guess;
mod powers;
mod relay;
mod session;
mod transport;
mod types;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::client::Driver;
use crate::powers::{ActivePower, Loadout, PassivePower};
use crate::transport::{LocalBus, RelayConnector};
use crate::types::*;

#[derive(Parser)]
#[command(name = "bitwin", about = "Two-player number guessing duel over a pub/sub relay")]
struct Cli {
    /// Relay base URL, overrides `brokerUrl` and `BROKER_URL`.
    #[arg(long, global = true)]
    broker: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server.
    Relay {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create a room and wait for an opponent.
    Host {
        #[command(flatten)]
        player: PlayerArgs,
        #[arg(long, value_enum, default_value_t = ModeArg::Classic)]
        mode: ModeArg,
    },
    /// Join a room by its 5-character code.
    Join {
        code: String,
        #[command(flatten)]
        player: PlayerArgs,
    },
    /// Play both seats on one terminal, no relay needed.
    Local {
        #[command(flatten)]
        player: PlayerArgs,
        /// Name of the second seat.
        #[arg(long, default_value = "PLAYER 2")]
        opponent: String,
        #[arg(long, default_value = "🐱")]
        opponent_avatar: String,
        #[arg(long, value_enum, default_value_t = ModeArg::Classic)]
        mode: ModeArg,
    },
}

#[derive(clap::Args)]
struct PlayerArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "🐸")]
    avatar: String,
    /// Active ability for power-up rounds.
    #[arg(long, default_value = "scan")]
    active: String,
    /// Passive ability for power-up rounds.
    #[arg(long, default_value = "thermal")]
    passive: String,
}

impl PlayerArgs {
    fn player(&self) -> anyhow::Result<Player> {
        Player::new(&self.name, self.avatar.as_str()).context("player name must not be empty")
    }

    fn loadout(&self) -> anyhow::Result<Loadout> {
        let active: ActivePower = self.active.parse().map_err(anyhow::Error::msg)?;
        let passive: PassivePower = self.passive.parse().map_err(anyhow::Error::msg)?;
        Ok(Loadout { active, passive })
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Classic,
    PowerUps,
}

impl From<ModeArg> for GameMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Classic => GameMode::Classic,
            ModeArg::PowerUps => GameMode::PowerUps,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bitwin=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    config::init().context("failed to initialize config directory")?;
    let mut settings = config::load().context("failed to load settings")?;
    if let Some(broker) = cli.broker {
        settings.broker_url = broker;
    }

    match cli.command {
        Command::Relay { port } => {
            relay::serve(port.unwrap_or(settings.relay_port))
                .await
                .context("relay server failed")?;
        }
        Command::Host { player, mode } => {
            let mut driver = Driver::new(RelayConnector::new(settings.broker_url.clone()), settings);
            driver.set_loadout(player.loadout()?);
            let room = driver.create(player.player()?, mode.into()).await?;
            println!("ROOM {} READY. SHARE THE CODE.", room);
            driver.run().await;
        }
        Command::Join { code, player } => {
            let room = RoomCode::parse(&code).context("room code must be 5 characters")?;
            let mut driver = Driver::new(RelayConnector::new(settings.broker_url.clone()), settings);
            driver.set_loadout(player.loadout()?);
            driver.join(room, player.player()?).await?;
            driver.run().await;
        }
        Command::Local {
            player,
            opponent,
            opponent_avatar,
            mode,
        } => {
            let second = Player::new(&opponent, opponent_avatar).context("opponent name must not be empty")?;
            let loadout = player.loadout()?;
            let bus = LocalBus::new();
            let mut host = Driver::new(bus.clone(), settings.clone()).with_label("[1]");
            host.set_loadout(loadout);
            let mut joiner = Driver::new(bus, settings).with_label("[2]");
            joiner.set_loadout(loadout);

            let room = host.create(player.player()?, mode.into()).await?;
            println!("ROOM {} OPEN ON THIS TERMINAL.", room);
            joiner.join(room, second).await?;
            client::run_hot_seat(host, joiner).await;
        }
    }
    Ok(())
}
