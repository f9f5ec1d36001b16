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

use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread,
};

use anyhow::Context;
use gmtunnel_protocol::{Envelope, SessionId};
use tracing::{error, info, instrument, warn};

use crate::{
    config::Tunables,
    relay,
    relay::{EgressQueue, ReaderArgs, WriterArgs},
    session::{Registry, SessionHandle},
};

pub struct ServerOpts {
    /// Port to accept Guacamole front-end connections on.
    pub port: u16,
    /// Cap on concurrently multiplexed sessions.
    pub max_clients: usize,
    /// Port to accept the reverse shipper's connection on.
    pub ddin_port: u16,
    /// Where the forward shipper is listening.
    pub ddout_host: String,
    pub ddout_port: u16,
}

/// The mux on the Guacamole-front-end side of the diode pair.
///
/// Sessions originate here: every accepted front-end connection gets a
/// fresh id, a `GMS_NEW` announcement on egress and a reader/writer
/// thread pair. The ingress handler routes reverse traffic back into
/// the sessions' inbound queues.
pub struct Server {
    listener: TcpListener,
    ingress_listener: TcpListener,
    egress_target: String,
    max_clients: usize,
    tunables: Tunables,
    registry: Registry,
}

impl Server {
    pub fn bind(opts: ServerOpts, tunables: Tunables) -> anyhow::Result<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", opts.port))
            .with_context(|| format!("binding front-end listener on port {}", opts.port))?;
        let ingress_listener = TcpListener::bind(("0.0.0.0", opts.ddin_port))
            .with_context(|| format!("binding ingress listener on port {}", opts.ddin_port))?;

        Ok(Arc::new(Server {
            listener,
            ingress_listener,
            egress_target: format!("{}:{}", opts.ddout_host, opts.ddout_port),
            max_clients: opts.max_clients,
            tunables,
            registry: Registry::new(),
        }))
    }

    pub fn frontend_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("front-end listener addr")
    }

    pub fn ingress_addr(&self) -> anyhow::Result<SocketAddr> {
        self.ingress_listener.local_addr().context("ingress listener addr")
    }

    #[instrument(skip_all)]
    pub fn serve(server: Arc<Self>) -> anyhow::Result<()> {
        let (egress, egress_rx) = EgressQueue::bounded(server.tunables.queue_capacity);
        relay::spawn_drain(
            server.egress_target.clone(),
            egress_rx,
            server.tunables.connect_retry,
        )
        .context("spawning egress drain thread")?;
        server.registry.spawn_reaper().context("spawning reaper thread")?;

        let ingress_server = Arc::clone(&server);
        let ingress_egress = egress.clone();
        thread::Builder::new()
            .name(String::from("ingress"))
            .spawn(move || {
                relay::run_ingress(
                    &ingress_server.registry,
                    &ingress_server.ingress_listener,
                    &ingress_egress,
                    ingress_server.tunables.max_instruction_size,
                    // sessions never originate on the guacd side
                    |id| warn!("unexpected GMS_NEW for '{}' from the diode, ignoring", id),
                );
            })
            .context("spawning ingress thread")?;

        info!("waiting for front-end connections");
        for stream in server.listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(err) = server.handle_frontend(stream, &egress) {
                        error!("handling new front-end connection: {:?}", err);
                    }
                }
                Err(err) => {
                    error!("accepting front-end connection: {:?}", err);
                }
            }
        }

        Ok(())
    }

    #[instrument(skip_all)]
    fn handle_frontend(&self, stream: TcpStream, egress: &EgressQueue) -> anyhow::Result<()> {
        if self.registry.len() >= self.max_clients {
            warn!(
                "refusing front-end connection, already serving {} sessions",
                self.max_clients
            );
            return Ok(());
        }

        let id = loop {
            let id = SessionId::generate();
            if !self.registry.contains(&id) {
                break id;
            }
        };
        info!("front-end connected, session '{}'", id);

        if let Err(err) = self.start_session(id.clone(), stream, egress) {
            // if the handle made it into the registry the peer may have
            // heard about the session, so close it out properly
            if self.registry.contains(&id) {
                self.registry.close_session(&id, egress);
            }
            return Err(err);
        }
        Ok(())
    }

    fn start_session(
        &self,
        id: SessionId,
        stream: TcpStream,
        egress: &EgressQueue,
    ) -> anyhow::Result<()> {
        let reader_stream =
            stream.try_clone().context("cloning front-end stream for the reader")?;
        let handle_stream =
            stream.try_clone().context("cloning front-end stream for the registry")?;

        let (inbound_tx, inbound_rx) =
            crossbeam_channel::bounded(self.tunables.queue_capacity);
        let handle = SessionHandle::new(id.clone(), handle_stream, inbound_tx);
        let running = handle.running_flag();
        self.registry.insert(handle);

        // announce the session before any of its traffic can reference it
        egress.push(Envelope::New(id.clone()).encode());

        relay::spawn_reader(ReaderArgs {
            registry: self.registry.clone(),
            id: id.clone(),
            stream: reader_stream,
            running: Arc::clone(&running),
            egress: egress.clone(),
            batch_size: self.tunables.batch_size,
            max_instruction_size: self.tunables.max_instruction_size,
        })
        .context("spawning reader thread")?;
        relay::spawn_writer(WriterArgs {
            registry: self.registry.clone(),
            id,
            stream,
            running,
            inbound: inbound_rx,
            egress: egress.clone(),
        })
        .context("spawning writer thread")?;

        Ok(())
    }
}
