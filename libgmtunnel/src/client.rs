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

use anyhow::{anyhow, Context};
use gmtunnel_protocol::{Envelope, SessionId};
use tracing::{error, info, instrument, warn};

use crate::{
    config::Tunables,
    relay,
    relay::{EgressQueue, ReaderArgs, WriterArgs},
    session::{Registry, SessionHandle},
};

pub struct ClientOpts {
    /// Where guacd is listening.
    pub guacd_host: String,
    pub guacd_port: u16,
    /// Port to accept the reverse shipper's connection on.
    pub ddin_port: u16,
    /// Where the forward shipper is listening.
    pub ddout_host: String,
    pub ddout_port: u16,
}

/// The mux on the guacd side of the diode pair.
///
/// The mirror image of the server mux, except that sessions arrive
/// instead of originating: a `GMS_NEW` from the diode opens an outbound
/// guacd connection, and a connection failure is reported straight back
/// as `GMS_CLOSE`. It also owns the periodic heartbeat that keeps the
/// diode carriers from going idle.
pub struct Client {
    ingress_listener: TcpListener,
    egress_target: String,
    guacd_target: String,
    tunables: Tunables,
    registry: Registry,
}

impl Client {
    pub fn bind(opts: ClientOpts, tunables: Tunables) -> anyhow::Result<Arc<Self>> {
        let ingress_listener = TcpListener::bind(("0.0.0.0", opts.ddin_port))
            .with_context(|| format!("binding ingress listener on port {}", opts.ddin_port))?;

        Ok(Arc::new(Client {
            ingress_listener,
            egress_target: format!("{}:{}", opts.ddout_host, opts.ddout_port),
            guacd_target: format!("{}:{}", opts.guacd_host, opts.guacd_port),
            tunables,
            registry: Registry::new(),
        }))
    }

    pub fn ingress_addr(&self) -> anyhow::Result<SocketAddr> {
        self.ingress_listener.local_addr().context("ingress listener addr")
    }

    #[instrument(skip_all)]
    pub fn serve(client: Arc<Self>) -> anyhow::Result<()> {
        let (egress, egress_rx) = EgressQueue::bounded(client.tunables.queue_capacity);
        relay::spawn_drain(
            client.egress_target.clone(),
            egress_rx,
            client.tunables.connect_retry,
        )
        .context("spawning egress drain thread")?;
        client.registry.spawn_reaper().context("spawning reaper thread")?;

        let ingress_client = Arc::clone(&client);
        let ingress_egress = egress.clone();
        let ingress_h = thread::Builder::new()
            .name(String::from("ingress"))
            .spawn(move || {
                relay::run_ingress(
                    &ingress_client.registry,
                    &ingress_client.ingress_listener,
                    &ingress_egress,
                    ingress_client.tunables.max_instruction_size,
                    |id| ingress_client.handle_new(id, &ingress_egress),
                );
            })
            .context("spawning ingress thread")?;

        let heartbeat = client.tunables.heartbeat;
        if heartbeat.is_zero() {
            info!("heartbeat disabled");
            return ingress_h.join().map_err(|e| anyhow!("ingress thread panicked: {:?}", e));
        }

        info!("emitting heartbeats every {:?}", heartbeat);
        loop {
            thread::sleep(heartbeat);
            egress.push(Envelope::Heartbeat.encode());
        }
    }

    #[instrument(skip_all, fields(s = %id))]
    fn handle_new(&self, id: SessionId, egress: &EgressQueue) {
        if self.registry.contains(&id) {
            warn!("duplicate GMS_NEW for '{}', ignoring", id);
            return;
        }

        info!("opening guacd connection for session '{}'", id);
        match TcpStream::connect(&self.guacd_target) {
            Ok(stream) => {
                if let Err(err) = self.start_session(id.clone(), stream, egress) {
                    error!("setting up session '{}': {:?}", id, err);
                    if self.registry.contains(&id) {
                        self.registry.close_session(&id, egress);
                    } else {
                        egress.push(Envelope::Close(id).encode());
                    }
                }
            }
            Err(err) => {
                warn!("cannot connect to guacd at {}: {}", self.guacd_target, err);
                egress.push(Envelope::Close(id).encode());
            }
        }
    }

    fn start_session(
        &self,
        id: SessionId,
        stream: TcpStream,
        egress: &EgressQueue,
    ) -> anyhow::Result<()> {
        let reader_stream =
            stream.try_clone().context("cloning guacd stream for the reader")?;
        let handle_stream =
            stream.try_clone().context("cloning guacd stream for the registry")?;

        let (inbound_tx, inbound_rx) =
            crossbeam_channel::bounded(self.tunables.queue_capacity);
        let handle = SessionHandle::new(id.clone(), handle_stream, inbound_tx);
        let running = handle.running_flag();
        self.registry.insert(handle);

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
