//! prontrd - printer control daemon
//!
//! Serves the printer property table, or talks to a running instance.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use prontrd::device::SimulatedDevice;
use prontrd::{lifecycle, logging, DaemonConfig, PropertyClient, PropertyServer, Response};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "prontrd")]
#[command(about = "Printer control daemon")]
#[command(version)]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, global = true, env = "PRONTRD_CONFIG")]
    config: Option<PathBuf>,

    /// Socket path, overriding the config file
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Serve {
        /// Detach from the terminal
        #[arg(long)]
        daemonize: bool,

        /// Write the daemon PID here
        #[arg(long)]
        pid_file: Option<PathBuf>,

        /// Log filter directive, e.g. `debug` or `prontrd=trace`
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Read a property from a running daemon
    Read {
        property: String,
    },

    /// Write a property on a running daemon
    Write {
        property: String,

        /// JSON value; anything that does not parse is sent as a string
        value: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }

    match cli.command.unwrap_or(Commands::Serve {
        daemonize: false,
        pid_file: None,
        log_level: None,
    }) {
        Commands::Serve {
            daemonize,
            pid_file,
            log_level,
        } => {
            if let Some(pid_file) = pid_file {
                config.pid_file = Some(pid_file);
            }
            if let Some(level) = log_level {
                config.logging.level = level;
            }
            serve(config, daemonize)
        }
        Commands::Read { property } => {
            let client = PropertyClient::new(config.socket_path());
            print_response(&client.read(&property)?)
        }
        Commands::Write { property, value } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let client = PropertyClient::new(config.socket_path());
            print_response(&client.write(&property, value)?)
        }
    }
}

fn serve(config: DaemonConfig, daemonize: bool) -> Result<()> {
    config.validate()?;
    let pid_file = config.pid_file();
    lifecycle::ensure_not_running(config.socket_path(), pid_file.as_deref())?;

    if daemonize {
        let Some(pid_file) = pid_file.as_deref() else {
            bail!("--daemonize requires a PID file (--pid-file or pid_file in config)");
        };
        lifecycle::daemonize(pid_file, None)?;
    } else if let Some(pid_file) = pid_file.as_deref() {
        lifecycle::write_pid_file(pid_file)?;
    }

    logging::init_logging(&config.logging)?;

    let device = SimulatedDevice::new();
    let table = device
        .table(config.power_settle())
        .context("Failed to build property table")?;

    let mut server = PropertyServer::from_config(table, &config);
    server
        .shutdown_handle()
        .register_signals()
        .context("Failed to install signal handlers")?;

    let result = server.serve();
    lifecycle::cleanup_pid_file(pid_file.as_deref());
    if let Err(e) = &result {
        tracing::error!(error = %e, "prontrd exited with error");
    }
    Ok(result?)
}

fn print_response(response: &Response) -> Result<()> {
    let line = response.encode();
    println!("{}", String::from_utf8_lossy(&line).trim_end());
    if response.is_error() {
        bail!("daemon rejected the request");
    }
    Ok(())
}
