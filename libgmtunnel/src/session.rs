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
    collections::HashMap,
    io,
    net::{Shutdown, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
};

use crossbeam_channel::TrySendError;
use gmtunnel_protocol::{Envelope, Instruction, SessionId};
use tracing::{debug, error, warn};

use crate::{consts, relay::EgressQueue};

/// The per-session record owned by a mux's registry.
///
/// The reader and writer threads never hold a reference to the handle;
/// they keep their own socket clones and a clone of the running flag and
/// re-reach the handle through the registry by id when they need to. The
/// handle's socket clone exists solely so the session can be shut down
/// from outside the threads that do I/O on it.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    stream: TcpStream,
    running: Arc<AtomicBool>,
    close_sent: Arc<AtomicBool>,
    inbound: crossbeam_channel::Sender<Instruction>,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        stream: TcpStream,
        inbound: crossbeam_channel::Sender<Instruction>,
    ) -> Self {
        SessionHandle {
            id,
            stream,
            running: Arc::new(AtomicBool::new(true)),
            close_sent: Arc::new(AtomicBool::new(false)),
            inbound,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The teardown flag shared with this session's reader and writer.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Begin teardown: clear the running flag and shut the socket down so
    /// any thread blocked on it wakes up with an error or a 0-length read.
    pub fn mark_dead(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.stream.shutdown(Shutdown::Both) {
                debug!("shutting down session '{}' socket: {}", self.id, err);
            }
        }
    }

    /// Route one instruction from the peer toward this session's socket.
    /// Never blocks; a full queue drops the instruction.
    pub fn enqueue(&self, instruction: Instruction) -> bool {
        match self.inbound.try_send(instruction) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                error!("inbound queue for session '{}' is full, dropping instruction", self.id);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("inbound queue for session '{}' is gone, dropping instruction", self.id);
                false
            }
        }
    }

    /// Each session announces its death to the peer at most once, no
    /// matter how many of reader exit, writer exit and ingress close race
    /// to report it. Returns true for the caller that won.
    fn claim_close_notice(&self) -> bool {
        !self.close_sent.swap(true, Ordering::AcqRel)
    }
}

/// The session table shared by every thread in a mux. The mutex guards
/// only map operations; nothing I/O-shaped happens with the lock held.
#[derive(Clone)]
pub struct Registry {
    sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { sessions: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn len(&self) -> usize {
        let sessions = self.sessions.lock().unwrap();
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        let sessions = self.sessions.lock().unwrap();
        sessions.contains_key(id)
    }

    /// Insert a fresh handle. Callers check for collisions first (the
    /// server re-draws ids, the client ignores duplicate GMS_NEW), so a
    /// replacement here means a bookkeeping bug rather than bad input.
    pub fn insert(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(old) = sessions.insert(handle.id().clone(), handle) {
            warn!("replaced a live handle for session '{}'", old.id());
            old.mark_dead();
        }
    }

    /// Run `f` against the named handle while the table lock is held.
    /// `f` must stay short: atomics, queue try-ops, socket shutdown.
    pub fn with<R>(&self, id: &SessionId, f: impl FnOnce(&SessionHandle) -> R) -> Option<R> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(id).map(f)
    }

    pub fn remove(&self, id: &SessionId) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(id);
    }

    /// Mark the session dead and tell the peer, exactly once per session.
    /// Used by the reader and writer on their way out and by anything
    /// else that notices the session is broken.
    pub fn close_session(&self, id: &SessionId, egress: &EgressQueue) {
        let announce = self.with(id, |handle| {
            handle.mark_dead();
            handle.claim_close_notice()
        });
        if announce.unwrap_or(false) {
            egress.push(Envelope::Close(id.clone()).encode());
        }
    }

    /// Mark the session dead without telling the peer; the close request
    /// came *from* the peer, so echoing it back would just bounce
    /// GMS_CLOSE messages between the muxes. Returns false for unknown ids.
    pub fn close_from_peer(&self, id: &SessionId) -> bool {
        self.with(id, |handle| {
            handle.claim_close_notice();
            handle.mark_dead();
        })
        .is_some()
    }

    /// Drop every handle whose running flag has cleared. Their threads
    /// have either exited already or will on their next wakeup; removing
    /// the entry also disconnects the inbound queue.
    pub fn reap(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, handle| handle.is_running());
        before - sessions.len()
    }

    pub fn spawn_reaper(&self) -> io::Result<thread::JoinHandle<()>> {
        let registry = self.clone();
        thread::Builder::new().name(String::from("reaper")).spawn(move || loop {
            thread::sleep(consts::REAP_INTERVAL);
            let reaped = registry.reap();
            if reaped > 0 {
                debug!("reaped {} dead sessions", reaped);
            }
        })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;

    use ntest::timeout;

    use crate::relay::EgressQueue;

    // A connected socket pair to stand in for a front-end or guacd
    // connection.
    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("binding listener");
        let addr = listener.local_addr().expect("listener addr");
        let client = TcpStream::connect(addr).expect("connecting");
        let (server, _) = listener.accept().expect("accepting");
        (client, server)
    }

    fn test_handle(id: &SessionId) -> (SessionHandle, crossbeam_channel::Receiver<Instruction>) {
        let (stream, _peer) = socket_pair();
        let (tx, rx) = crossbeam_channel::bounded(4);
        (SessionHandle::new(id.clone(), stream, tx), rx)
    }

    fn parse_one(bytes: &[u8]) -> Instruction {
        let mut v = gmtunnel_protocol::Validator::new();
        v.feed(bytes);
        v.next_instruction().expect("an instruction")
    }

    #[test]
    #[timeout(30000)]
    fn one_handle_per_id() {
        let registry = Registry::new();
        let id = SessionId::generate();

        let (first, _rx1) = test_handle(&id);
        let first_running = first.running_flag();
        registry.insert(first);
        assert_eq!(registry.len(), 1);

        // a second insert for the same id replaces and kills the old one
        let (second, _rx2) = test_handle(&id);
        registry.insert(second);
        assert_eq!(registry.len(), 1);
        assert!(!first_running.load(Ordering::Acquire));
    }

    #[test]
    #[timeout(30000)]
    fn mark_dead_is_visible_and_reaped() {
        let registry = Registry::new();
        let id = SessionId::generate();
        let (handle, _rx) = test_handle(&id);
        registry.insert(handle);

        assert!(registry.with(&id, |h| h.is_running()).unwrap());
        registry.with(&id, |h| h.mark_dead());
        // still discoverable until the reaper runs
        assert!(registry.contains(&id));
        assert!(!registry.with(&id, |h| h.is_running()).unwrap());

        assert_eq!(registry.reap(), 1);
        assert!(!registry.contains(&id));
    }

    #[test]
    #[timeout(30000)]
    fn close_session_announces_exactly_once() {
        let registry = Registry::new();
        let id = SessionId::generate();
        let (handle, _rx) = test_handle(&id);
        registry.insert(handle);

        let (egress, egress_rx) = EgressQueue::bounded(4);
        // reader exit, writer exit and a stray close all race; one wins
        registry.close_session(&id, &egress);
        registry.close_session(&id, &egress);
        registry.close_session(&id, &egress);

        let frame = egress_rx.try_recv().expect("one close frame");
        assert_eq!(frame, Envelope::Close(id.clone()).encode());
        assert!(egress_rx.try_recv().is_err());
    }

    #[test]
    #[timeout(30000)]
    fn close_from_peer_suppresses_the_echo() {
        let registry = Registry::new();
        let id = SessionId::generate();
        let (handle, _rx) = test_handle(&id);
        registry.insert(handle);

        let (egress, egress_rx) = EgressQueue::bounded(4);
        assert!(registry.close_from_peer(&id));
        // the reader/writer exit path now has nothing to announce
        registry.close_session(&id, &egress);
        assert!(egress_rx.try_recv().is_err());

        assert!(!registry.close_from_peer(&SessionId::generate()));
    }

    #[test]
    #[timeout(30000)]
    fn enqueue_drops_when_full() {
        let id = SessionId::generate();
        let (stream, _peer) = socket_pair();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = SessionHandle::new(id, stream, tx);

        assert!(handle.enqueue(parse_one(b"4.ping,0.;")));
        assert!(!handle.enqueue(parse_one(b"4.ping,0.;")));

        // the queued instruction is still intact
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.as_bytes(), b"4.ping,0.;");
    }
}
