use clap::{Parser, ValueEnum};
use client::config::ClientConfig;
use client::game::{ClientStateManager, ReconcileMode};
use client::input::{parse_command, Command, HELP};
use client::lobby::LobbyView;
use client::network::{ClientEvent, NetworkClient};
use log::{debug, info, warn};
use shared::snake::SnakeWorld;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Reconcile {
    Adopt,
    Preserve,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Console client for the multiplayer snake server")]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Token sent right after connecting
    #[arg(long)]
    auth_token: Option<String>,

    /// Seconds between lobby list refreshes
    #[arg(long, default_value = "5")]
    sync_interval: u64,

    /// Server ticks per second, used to move the local snake between snapshots
    #[arg(long, default_value = "30")]
    tick_rate: u32,

    /// What to do with the local snake when a snapshot arrives
    #[arg(long, value_enum, default_value = "adopt")]
    reconcile: Reconcile,
}

impl Args {
    fn into_config(self) -> ClientConfig {
        ClientConfig {
            server_addr: self.server,
            auth_token: self.auth_token,
            sync_interval: Duration::from_secs(self.sync_interval.max(1)),
            tick_interval: Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64),
            reconcile_mode: match self.reconcile {
                Reconcile::Adopt => ReconcileMode::AlwaysAdopt,
                Reconcile::Preserve => ReconcileMode::PreserveLocal,
            },
            ..ClientConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = Args::parse().into_config();
    let (network, mut events) = NetworkClient::connect::<SnakeWorld>(&config).await?;

    let mut lobby = LobbyView::new(network.client_id());
    let mut state = ClientStateManager::new(SnakeWorld::default(), config.reconcile_mode)
        .with_tick_interval(config.tick_interval);
    state.set_client_id(network.client_id());

    println!("connected as {} (type 'help')", network.client_id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut frame = interval(Duration::from_millis(16));
    frame.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_head = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    network.disconnect();
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let command = match parse_command(&line) {
                    Ok(command) => command,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                let sent = match command {
                    Command::Create => network.create_lobby(),
                    Command::List => network.sync_lobbies(),
                    Command::Join(code) => {
                        lobby.request_join(&code);
                        network.join_lobby(&code)
                    }
                    Command::Leave => match lobby.lobby_id() {
                        Some(code) => network.leave_lobby(code),
                        None => {
                            println!("not in a lobby");
                            Ok(())
                        }
                    },
                    Command::Ready => network.toggle_ready(),
                    Command::Start => network.start_game(),
                    Command::Kick(id) => network.kick(&id),
                    Command::Promote(id) => network.promote(&id),
                    Command::Auth(token) => network.authenticate(&token),
                    Command::Steer(_) if !lobby.is_playing() => {
                        println!("no game running");
                        Ok(())
                    }
                    Command::Steer(direction) => match state.apply_local_input(direction.as_str()) {
                        Some(input) => network.send_input(&input),
                        None => Ok(()),
                    },
                    Command::Help => {
                        println!("{}", HELP);
                        Ok(())
                    }
                    Command::Quit => {
                        network.disconnect();
                        break;
                    }
                };
                if let Err(e) = sent {
                    warn!("Could not send command: {}", e);
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                // Leaving ends the game.
                if lobby.is_departure(&event) {
                    state.reset(SnakeWorld::default());
                }
                lobby.apply(&event);
                match event {
                    ClientEvent::ServerState(snapshot) => state.reconcile(snapshot),
                    ClientEvent::LobbiesSynced(lobbies) => {
                        debug!("{} lobbies available", lobbies.len());
                    }
                    ClientEvent::Disconnected(reason) => {
                        let reason = reason.map(|r| format!(": {}", r)).unwrap_or_default();
                        println!("disconnected{}", reason);
                        break;
                    }
                    ClientEvent::LobbyCreated(code) => println!("created lobby {}", code),
                    ClientEvent::Countdown(remaining) => println!("starting in {}", remaining),
                    ClientEvent::GameStarted => println!("game started"),
                    other => info!("{:?}", other),
                }
            }
            _ = frame.tick() => {
                let head = state
                    .update()
                    .snake(network.client_id())
                    .and_then(|snake| snake.head());
                if head != last_head {
                    if let Some(position) = head {
                        debug!("head at ({}, {})", position.x, position.y);
                    }
                    last_head = head;
                }
            }
        }
    }

    Ok(())
}
