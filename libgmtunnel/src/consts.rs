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

use std::time;

/// Read buffer for TCP sockets.
pub const BUF_SIZE: usize = 1024 * 16;

/// Strict per-datagram cap on the diode carriers. One TCP read on the
/// ship-out side becomes at most one datagram of this size.
pub const SHIP_MTU: usize = 8192;

// Port conventions: the front-end listener and guacd both follow the
// Guacamole default; the diode-side hops get their own range.
pub const DEFAULT_GUACAMOLE_PORT: u16 = 4822;
pub const DEFAULT_GUACD_PORT: u16 = 4822;
pub const DEFAULT_DDOUT_PORT: u16 = 10000;
pub const DEFAULT_DDIN_PORT: u16 = 20000;
pub const DEFAULT_DIODE_UDP_PORT: u16 = 40000;

pub const DEFAULT_HOST: &str = "127.0.0.1";

pub const DEFAULT_MAX_CLIENTS: usize = 25;
pub const DEFAULT_BATCH_SIZE: usize = 8192;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 20;
pub const DEFAULT_CONNECT_RETRY_SECS: u64 = 1;

/// How often blocked consumers wake up to observe a cleared running flag.
pub const QUEUE_POLL_TIMEOUT: time::Duration = time::Duration::from_millis(100);

/// How often the registry sweeps out dead session handles.
pub const REAP_INTERVAL: time::Duration = time::Duration::from_millis(500);
