//! relay: control the relay daemon and run agent sessions under it.
//!
//! ## Subcommands
//!
//! - `daemon start|stop|status|list|stop-session|spawn`: daemon control
//! - `session`: session runner (spawned by the daemon, or run from a terminal)

mod daemon_client;
mod daemon_cmd;
mod error;
mod logging;
mod session;

use clap::{Parser, Subcommand, ValueEnum};
use relay_daemon_protocol::StartedBy;
use std::path::PathBuf;
use std::process::ExitCode;

use crate::daemon_client::{relay_home, DAEMON_PORT_ENV, HOME_DIR_ENV};
use crate::error::Result;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Relay agent sessions through a per-machine daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Run an agent session and report it to the daemon
    Session {
        /// Remote session id (generated when omitted)
        #[arg(long)]
        session_id: Option<String>,

        /// Who started this session
        #[arg(long, value_enum, default_value_t = Origin::Terminal)]
        started_by: Origin,

        /// Agent command and arguments (defaults to $RELAY_AGENT_COMMAND or `claude`)
        #[arg(last = true)]
        agent: Vec<String>,
    },
}

#[derive(Subcommand)]
enum DaemonCommand {
    /// Start the daemon in the background
    Start,
    /// Ask the daemon to stop, killing it if it does not
    Stop,
    /// Show the daemon's state file
    Status,
    /// List tracked sessions
    List,
    /// Stop one session
    StopSession {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },
    /// Spawn a session in a directory
    Spawn {
        #[arg(value_name = "DIR")]
        directory: PathBuf,

        /// Session id to hand to the new session
        #[arg(long)]
        session_id: Option<String>,

        /// Create the directory if it does not exist
        #[arg(long)]
        approve: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Origin {
    Daemon,
    Terminal,
}

impl From<Origin> for StartedBy {
    fn from(origin: Origin) -> Self {
        match origin {
            Origin::Daemon => StartedBy::Daemon,
            Origin::Terminal => StartedBy::Terminal,
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let home = relay_home(std::env::var(HOME_DIR_ENV).ok())?;
    match cli.command {
        Commands::Daemon { command } => match command {
            DaemonCommand::Start => daemon_cmd::start(&home),
            DaemonCommand::Stop => daemon_cmd::stop(&home),
            DaemonCommand::Status => daemon_cmd::status(&home),
            DaemonCommand::List => daemon_cmd::list(&home),
            DaemonCommand::StopSession { session_id } => {
                daemon_cmd::stop_session(&home, &session_id)
            }
            DaemonCommand::Spawn {
                directory,
                session_id,
                approve,
            } => daemon_cmd::spawn(&home, &directory, session_id, approve),
        },
        Commands::Session {
            session_id,
            started_by,
            agent,
        } => {
            let daemon_port = std::env::var(DAEMON_PORT_ENV)
                .ok()
                .and_then(|value| value.trim().parse::<u16>().ok());
            let options = session::SessionOptions {
                session_id,
                started_by: started_by.into(),
                daemon_port,
                agent,
            };
            // Only returns if exec failed.
            session::run(&home, options).map(|never| match never {})
        }
    }
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "relay failed");
            eprintln!("relay: {}", err);
            ExitCode::FAILURE
        }
    }
}
