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

//! The moving parts both muxes are assembled from: the per-session
//! reader and writer threads, the shared egress queue with its drain
//! thread, and the ingress loop that routes validated instructions from
//! the diode to their sessions.

use std::{
    io,
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread, time,
};

use anyhow::Context;
use crossbeam_channel::{RecvTimeoutError, TrySendError};
use gmtunnel_protocol::{Batch, Envelope, Instruction, SessionId, Validator};
use tracing::{debug, error, info, span, trace, warn, Level};

use crate::{consts, net, session::Registry};

/// The per-mux queue of framed buffers headed for the diode.
/// Many-producer (session readers, ingress replies, heartbeat),
/// single-consumer (the drain thread).
#[derive(Clone)]
pub struct EgressQueue {
    tx: crossbeam_channel::Sender<Vec<u8>>,
}

impl EgressQueue {
    pub fn bounded(cap: usize) -> (EgressQueue, crossbeam_channel::Receiver<Vec<u8>>) {
        let (tx, rx) = crossbeam_channel::bounded(cap);
        (EgressQueue { tx }, rx)
    }

    /// Queue a framed buffer. Never blocks: the diode cannot signal
    /// backpressure, so a full queue means the link is oversubscribed
    /// and the honest disposition is to drop the frame and say so.
    pub fn push(&self, frame: Vec<u8>) {
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => error!("egress queue full, dropping frame"),
            Err(TrySendError::Disconnected(_)) => debug!("egress queue is gone, dropping frame"),
        }
    }
}

/// Drain the egress queue into an outbound TCP connection toward the
/// paired shipper, reconnecting on error without losing the frame at
/// the head of the queue.
pub fn spawn_drain(
    target: String,
    rx: crossbeam_channel::Receiver<Vec<u8>>,
    backoff: time::Duration,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name(String::from("egress")).spawn(move || {
        let _s = span!(Level::INFO, "egress").entered();
        let mut stream = net::connect_with_retry(&target, backoff);
        let mut pending: Option<Vec<u8>> = None;
        loop {
            let frame = match pending.take() {
                Some(frame) => frame,
                None => match rx.recv() {
                    Ok(frame) => frame,
                    Err(_) => {
                        info!("egress queue closed, exiting");
                        return;
                    }
                },
            };
            if let Err(err) = stream.write_all(&frame) {
                warn!("egress write failed, reconnecting: {}", err);
                pending = Some(frame);
                stream = net::connect_with_retry(&target, backoff);
            }
        }
    })
}

pub struct ReaderArgs {
    pub registry: Registry,
    pub id: SessionId,
    /// The session socket (front-end on the server, guacd on the client).
    pub stream: TcpStream,
    pub running: Arc<AtomicBool>,
    pub egress: EgressQueue,
    pub batch_size: usize,
    pub max_instruction_size: usize,
}

/// The session's socket-to-diode half: read chunks, re-frame them into
/// whole instructions, group the instructions into GMS_START/GMS_END
/// batches and queue the batches for the diode. Exits when the peer
/// hangs up or the session is marked dead, announcing GMS_CLOSE if this
/// side noticed first.
pub fn spawn_reader(args: ReaderArgs) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name(format!("reader({})", args.id)).spawn(move || {
        let ReaderArgs {
            registry,
            id,
            mut stream,
            running,
            egress,
            batch_size,
            max_instruction_size,
        } = args;
        let _s = span!(Level::INFO, "reader", s = %id).entered();

        let mut validator = Validator::with_limit(max_instruction_size);
        let mut batch = Batch::new(id.clone(), batch_size);
        let mut buf = vec![0u8; consts::BUF_SIZE];

        while running.load(Ordering::Acquire) {
            let len = match stream.read(&mut buf) {
                Ok(0) => {
                    info!("peer closed the connection");
                    break;
                }
                Ok(len) => len,
                Err(err) => {
                    info!("read error: {}", err);
                    break;
                }
            };
            trace!("read {} bytes", len);

            validator.feed(&buf[..len]);
            while let Some(instruction) = validator.next_instruction() {
                if let Some(frame) = batch.push(&instruction) {
                    egress.push(frame);
                }
            }
            // the validator ran dry for this read, so the batch ends here
            if let Some(frame) = batch.flush() {
                egress.push(frame);
            }
        }

        registry.close_session(&id, &egress);
        info!("exiting");
    })
}

pub struct WriterArgs {
    pub registry: Registry,
    pub id: SessionId,
    pub stream: TcpStream,
    pub running: Arc<AtomicBool>,
    pub inbound: crossbeam_channel::Receiver<Instruction>,
    pub egress: EgressQueue,
}

/// The session's diode-to-socket half: pop instructions routed to this
/// session and write them out. The pop times out regularly so a cleared
/// running flag is observed even when the peer has gone quiet.
pub fn spawn_writer(args: WriterArgs) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name(format!("writer({})", args.id)).spawn(move || {
        let WriterArgs { registry, id, mut stream, running, inbound, egress } = args;
        let _s = span!(Level::INFO, "writer", s = %id).entered();

        loop {
            if !running.load(Ordering::Acquire) {
                break;
            }
            match inbound.recv_timeout(consts::QUEUE_POLL_TIMEOUT) {
                Ok(instruction) => {
                    if let Err(err) = stream.write_all(instruction.as_bytes()) {
                        info!("write error: {}", err);
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("inbound queue disconnected");
                    break;
                }
            }
        }

        registry.close_session(&id, &egress);
        info!("exiting");
    })
}

/// Accept connections from the reverse shipper and route everything
/// they carry. The shipper may come and go; each new connection gets a
/// fresh validator and a fresh batch-target state.
///
/// `on_new` is the one point where the two muxes differ: the client mux
/// opens a guacd connection, the server mux just shrugs.
pub fn run_ingress<F>(
    registry: &Registry,
    listener: &TcpListener,
    egress: &EgressQueue,
    max_instruction_size: usize,
    on_new: F,
) where
    F: Fn(SessionId),
{
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                info!("ingress shipper connected");
                if let Err(err) =
                    ingress_stream(registry, stream, egress, max_instruction_size, &on_new)
                {
                    warn!("ingress connection ended: {:?}", err);
                }
            }
            Err(err) => {
                error!("accepting ingress connection: {:?}", err);
            }
        }
    }
}

fn ingress_stream<F>(
    registry: &Registry,
    mut stream: TcpStream,
    egress: &EgressQueue,
    max_instruction_size: usize,
    on_new: &F,
) -> anyhow::Result<()>
where
    F: Fn(SessionId),
{
    let mut validator = Validator::with_limit(max_instruction_size);
    let mut current: Option<SessionId> = None;
    let mut buf = vec![0u8; consts::BUF_SIZE];

    loop {
        let len = stream.read(&mut buf).context("reading ingress stream")?;
        if len == 0 {
            info!("ingress shipper disconnected");
            return Ok(());
        }

        validator.feed(&buf[..len]);
        while let Some(instruction) = validator.next_instruction() {
            dispatch(registry, egress, &mut current, instruction, on_new);
        }
    }
}

/// Apply one validated instruction from the diode: envelope messages
/// steer the routing state, everything else lands on the current
/// target's inbound queue.
fn dispatch<F>(
    registry: &Registry,
    egress: &EgressQueue,
    current: &mut Option<SessionId>,
    instruction: Instruction,
    on_new: &F,
) where
    F: Fn(SessionId),
{
    if Envelope::is_envelope(&instruction) {
        match Envelope::decode(&instruction) {
            Ok(Envelope::Start(id)) => {
                // A dead-but-unreaped handle still counts as known; its
                // instructions just fall on the floor further down.
                if registry.contains(&id) {
                    *current = Some(id);
                } else {
                    info!("batch for unknown session '{}', telling the peer to close it", id);
                    egress.push(Envelope::Close(id).encode());
                    *current = None;
                }
            }
            Ok(Envelope::End(id)) => {
                if let Some(cur) = current.as_ref() {
                    if *cur != id {
                        warn!("GMS_END for '{}' does not match open batch for '{}'", id, cur);
                    }
                }
                // treat it as the end of the batch either way
                *current = None;
            }
            Ok(Envelope::Close(id)) => {
                info!("peer closed session '{}'", id);
                if !registry.close_from_peer(&id) {
                    debug!("GMS_CLOSE for a session we do not have");
                }
                if current.as_ref() == Some(&id) {
                    *current = None;
                }
            }
            Ok(Envelope::New(id)) => on_new(id),
            Ok(Envelope::Heartbeat) => trace!("heartbeat from peer"),
            Err(err) => warn!("dropping malformed envelope instruction: {:#}", err),
        }
    } else if let Some(id) = current.as_ref() {
        if registry.with(id, |handle| handle.enqueue(instruction)).is_none() {
            debug!("dropping instruction for vanished session '{}'", id);
        }
    } else {
        debug!("dropping instruction that arrived outside any session batch");
    }
}
