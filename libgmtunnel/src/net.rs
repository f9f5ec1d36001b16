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

use std::{net::TcpStream, thread, time};

use tracing::{info, warn};

/// Dial a TCP peer that may not be up yet, backing off between attempts.
/// The peers in question (shippers and muxes) come and go independently,
/// so this never gives up; cancellation is process shutdown.
pub fn connect_with_retry(addr: &str, backoff: time::Duration) -> TcpStream {
    let mut logged = false;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                info!("connected to {}", addr);
                return stream;
            }
            Err(err) => {
                // one line per outage, not one per attempt
                if !logged {
                    warn!("cannot connect to {} yet, retrying: {}", addr, err);
                    logged = true;
                }
                thread::sleep(backoff);
            }
        }
    }
}
