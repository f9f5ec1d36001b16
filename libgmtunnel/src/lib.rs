// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs, io, sync::Mutex};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod client;
mod config;
mod consts;
mod net;
pub mod relay;
pub mod server;
pub mod session;
pub mod shipper;
mod signals;

pub use config::{Config, Tunables};

/// The command line arguments that gmtunnel expects.
/// These can be directly parsed with clap or manually
/// constructed in order to present some other user
/// interface.
///
/// NOTE: You must check `version()` and handle it yourself
/// if it is set. Clap won't do a good job with its
/// automatic version support for a library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

By default logs go to stderr."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The four process roles that together form one tunnel:
/// `Guacamole <-> server <-> ship-out =diode=> ship-in <-> client <-> guacd`
/// in the forward direction, mirrored through a second diode for the
/// reverse direction.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Runs the mux that accepts Guacamole front-end connections")]
    Server {
        #[clap(
            long,
            default_value_t = consts::DEFAULT_GUACAMOLE_PORT,
            help = "Port to accept Guacamole front-end connections on"
        )]
        port: u16,
        #[clap(long, help = "Maximum number of concurrently multiplexed sessions")]
        max_clients: Option<usize>,
        #[clap(
            long,
            default_value_t = consts::DEFAULT_DDIN_PORT,
            help = "Port to accept the reverse shipper's connection on"
        )]
        ddin_port: u16,
        #[clap(
            long,
            default_value = consts::DEFAULT_HOST,
            help = "Host the forward shipper is listening on"
        )]
        ddout_host: String,
        #[clap(
            long,
            default_value_t = consts::DEFAULT_DDOUT_PORT,
            help = "Port the forward shipper is listening on"
        )]
        ddout_port: u16,
    },

    #[clap(about = "Runs the mux that opens guacd connections for tunneled sessions")]
    Client {
        #[clap(
            long,
            default_value = consts::DEFAULT_HOST,
            help = "Host guacd is listening on"
        )]
        guacd_host: String,
        #[clap(
            long,
            default_value_t = consts::DEFAULT_GUACD_PORT,
            help = "Port guacd is listening on"
        )]
        guacd_port: u16,
        #[clap(
            long,
            default_value_t = consts::DEFAULT_DDIN_PORT,
            help = "Port to accept the reverse shipper's connection on"
        )]
        ddin_port: u16,
        #[clap(
            long,
            default_value = consts::DEFAULT_HOST,
            help = "Host the forward shipper is listening on"
        )]
        ddout_host: String,
        #[clap(
            long,
            default_value_t = consts::DEFAULT_DDOUT_PORT,
            help = "Port the forward shipper is listening on"
        )]
        ddout_port: u16,
    },

    #[clap(about = "Runs the relay that sends a mux's framed stream into a diode as UDP")]
    ShipOut {
        #[clap(
            long,
            default_value_t = consts::DEFAULT_DDOUT_PORT,
            help = "Port to accept the mux's framed TCP stream on"
        )]
        port: u16,
        #[clap(
            long,
            default_value = consts::DEFAULT_HOST,
            help = "Host the diode delivers datagrams to (the ship-in side)"
        )]
        ddout_host: String,
        #[clap(
            long,
            default_value_t = consts::DEFAULT_DIODE_UDP_PORT,
            help = "UDP port the diode delivers datagrams to"
        )]
        ddout_port: u16,
    },

    #[clap(about = "Runs the relay that receives a diode's UDP datagrams and feeds a mux")]
    ShipIn {
        #[clap(
            long,
            default_value_t = consts::DEFAULT_DIODE_UDP_PORT,
            help = "UDP port to receive diode datagrams on"
        )]
        ddin_port: u16,
        #[clap(
            long,
            default_value = consts::DEFAULT_HOST,
            help = "Host of the mux to forward the stream to"
        )]
        gmx_host: String,
        #[clap(
            long,
            default_value_t = consts::DEFAULT_DDIN_PORT,
            help = "Port of the mux to forward the stream to"
        )]
        gmx_port: u16,
        #[clap(
            long,
            action,
            help = "Forward datagrams without protocol validation (debugging only)"
        )]
        no_validate: bool,
    },
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Run the gmtunnel role selected by the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let config = config::read_config(&args.config_file).context("reading config")?;
    let tunables = Tunables::from_config(&config);

    signals::Handler::new().spawn()?;

    let res: anyhow::Result<()> = match args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Server { port, max_clients, ddin_port, ddout_host, ddout_port } => {
            let opts = server::ServerOpts {
                port,
                max_clients: max_clients
                    .or(config.max_clients)
                    .unwrap_or(consts::DEFAULT_MAX_CLIENTS),
                ddin_port,
                ddout_host,
                ddout_port,
            };
            server::Server::bind(opts, tunables).and_then(server::Server::serve)
        }
        Commands::Client { guacd_host, guacd_port, ddin_port, ddout_host, ddout_port } => {
            let opts =
                client::ClientOpts { guacd_host, guacd_port, ddin_port, ddout_host, ddout_port };
            client::Client::bind(opts, tunables).and_then(client::Client::serve)
        }
        Commands::ShipOut { port, ddout_host, ddout_port } => {
            let opts = shipper::ShipOutOpts { port, ddout_host, ddout_port };
            shipper::ShipOut::bind(opts).and_then(|ship| ship.serve())
        }
        Commands::ShipIn { ddin_port, gmx_host, gmx_port, no_validate } => {
            let opts = shipper::ShipInOpts { ddin_port, gmx_host, gmx_port, no_validate };
            shipper::ShipIn::bind(opts, tunables.max_instruction_size, tunables.connect_retry)
                .and_then(|ship| ship.serve())
        }
    };

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
