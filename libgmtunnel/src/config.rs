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

use std::{env, fs, path::PathBuf, time};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::consts;

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else if let Ok(home) = env::var("HOME") {
        let mut config_path = PathBuf::from(home);
        config_path.push(".config");
        config_path.push("gmtunnel");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// Cap on concurrently multiplexed sessions. Front-end connections
    /// beyond the cap are closed immediately. Defaults to 25.
    pub max_clients: Option<usize>,

    /// Upper bound in bytes for a single Guacamole instruction.
    /// Anything larger is rejected by the validator. Defaults to 20480.
    pub max_instruction_size: Option<usize>,

    /// Byte cap for one GMS_START/GMS_END batch on the diode carriers.
    /// Must stay at or below the diode datagram size. Defaults to 8192.
    pub batch_size: Option<usize>,

    /// Entry cap for the per-session inbound queues and the per-mux
    /// egress queue. Producers never block: enqueues into a full queue
    /// are dropped and logged. Defaults to 1024.
    pub queue_capacity: Option<usize>,

    /// Seconds between GMS_HEARTBEAT messages emitted by the client mux
    /// to keep the diode carriers from going idle. 0 disables the
    /// heartbeat. Defaults to 20.
    pub heartbeat_secs: Option<u64>,

    /// Seconds to back off between outbound TCP connection attempts
    /// toward a shipper or mux that is not up yet. Defaults to 1.
    pub connect_retry_secs: Option<u64>,
}

/// The resolved knobs handed to the muxes and shippers, with defaults
/// from `consts` applied on top of whatever the config file provided.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub max_instruction_size: usize,
    pub batch_size: usize,
    pub queue_capacity: usize,
    pub heartbeat: time::Duration,
    pub connect_retry: time::Duration,
}

impl Tunables {
    pub fn from_config(config: &Config) -> Self {
        Tunables {
            max_instruction_size: config
                .max_instruction_size
                .unwrap_or(gmtunnel_protocol::DEFAULT_MAX_INSTRUCTION_SIZE),
            batch_size: config.batch_size.unwrap_or(consts::DEFAULT_BATCH_SIZE),
            queue_capacity: config.queue_capacity.unwrap_or(consts::DEFAULT_QUEUE_CAPACITY),
            heartbeat: time::Duration::from_secs(
                config.heartbeat_secs.unwrap_or(consts::DEFAULT_HEARTBEAT_SECS),
            ),
            connect_retry: time::Duration::from_secs(
                config.connect_retry_secs.unwrap_or(consts::DEFAULT_CONNECT_RETRY_SECS),
            ),
        }
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables::from_config(&Config::default())
    }
}
