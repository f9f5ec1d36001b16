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

//! The single-purpose relays that physically cross one diode. Ship-out
//! turns a framed TCP stream from a mux into UDP datagrams; ship-in
//! turns the datagrams back into a TCP stream toward the peer mux,
//! re-validating at the trust boundary on the way.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, UdpSocket},
    time,
};

use anyhow::Context;
use gmtunnel_protocol::Validator;
use tracing::{debug, error, info, instrument, warn};

use crate::{consts, net};

pub struct ShipOutOpts {
    /// Port to accept the mux's framed TCP stream on.
    pub port: u16,
    /// The diode entrance: where ship-in's UDP port is reachable.
    pub ddout_host: String,
    pub ddout_port: u16,
}

/// The sending half of a diode crossing. Each TCP read becomes exactly
/// one UDP datagram; reads are capped at the diode MTU, and anything
/// that spans reads is reassembled by the validator on the far side.
/// Nothing ever flows back.
pub struct ShipOut {
    listener: TcpListener,
    udp_target: String,
}

impl ShipOut {
    pub fn bind(opts: ShipOutOpts) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", opts.port))
            .with_context(|| format!("binding mux listener on port {}", opts.port))?;
        Ok(ShipOut {
            listener,
            udp_target: format!("{}:{}", opts.ddout_host, opts.ddout_port),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("mux listener addr")
    }

    #[instrument(skip_all)]
    pub fn serve(&self) -> anyhow::Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").context("binding udp send socket")?;

        loop {
            info!("waiting for a mux connection");
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    info!("mux connected from {}", addr);
                    if let Err(err) = self.pump(stream, &socket) {
                        warn!("mux connection ended: {:?}", err);
                    }
                }
                Err(err) => {
                    error!("accepting mux connection: {:?}", err);
                }
            }
        }
    }

    fn pump(&self, mut stream: TcpStream, socket: &UdpSocket) -> anyhow::Result<()> {
        let mut buf = vec![0u8; consts::SHIP_MTU];
        loop {
            let len = stream.read(&mut buf).context("reading framed stream")?;
            if len == 0 {
                info!("mux disconnected");
                return Ok(());
            }
            // a lost datagram is a lost datagram; the diode offers no
            // better and the peer validator re-frames whatever arrives
            if let Err(err) = socket.send_to(&buf[..len], &*self.udp_target) {
                warn!("sending datagram to {}: {}", self.udp_target, err);
            }
        }
    }
}

pub struct ShipInOpts {
    /// UDP port the diode delivers datagrams to.
    pub ddin_port: u16,
    /// The mux (server or client) to forward the stream to.
    pub gmx_host: String,
    pub gmx_port: u16,
    /// Pass datagrams through without validation. Debugging only.
    pub no_validate: bool,
}

/// The receiving half of a diode crossing. Datagram boundaries stop
/// meaning anything here: payloads are fed through a validator and the
/// surviving instructions are streamed to the mux over TCP. Garbage
/// injected into the diode dies at this boundary.
pub struct ShipIn {
    socket: UdpSocket,
    mux_target: String,
    validate: bool,
    max_instruction_size: usize,
    connect_retry: time::Duration,
}

impl ShipIn {
    pub fn bind(
        opts: ShipInOpts,
        max_instruction_size: usize,
        connect_retry: time::Duration,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", opts.ddin_port))
            .with_context(|| format!("binding diode udp port {}", opts.ddin_port))?;
        Ok(ShipIn {
            socket,
            mux_target: format!("{}:{}", opts.gmx_host, opts.gmx_port),
            validate: !opts.no_validate,
            max_instruction_size,
            connect_retry,
        })
    }

    pub fn udp_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr().context("diode udp addr")
    }

    #[instrument(skip_all)]
    pub fn serve(&self) -> anyhow::Result<()> {
        if !self.validate {
            warn!("protocol validation disabled, forwarding datagrams verbatim");
        }

        let mut stream = net::connect_with_retry(&self.mux_target, self.connect_retry);
        // one validator for the lifetime of the udp stream, so an
        // instruction split across datagrams survives reassembly
        let mut validator = Validator::with_limit(self.max_instruction_size);
        let mut buf = vec![0u8; consts::SHIP_MTU];

        loop {
            let len = match self.socket.recv_from(&mut buf) {
                Ok((len, _peer)) => len,
                Err(err) => {
                    error!("receiving datagram: {}", err);
                    continue;
                }
            };
            debug!("received {} byte datagram", len);

            if self.validate {
                validator.feed(&buf[..len]);
                while let Some(instruction) = validator.next_instruction() {
                    self.forward(&mut stream, instruction.as_bytes());
                }
            } else {
                self.forward(&mut stream, &buf[..len]);
            }
        }
    }

    /// Write toward the mux, reconnecting for as long as it takes. The
    /// bytes in hand are never dropped; anything arriving on the UDP
    /// socket in the meantime is the kernel buffer's problem.
    fn forward(&self, stream: &mut TcpStream, bytes: &[u8]) {
        loop {
            match stream.write_all(bytes) {
                Ok(()) => return,
                Err(err) => {
                    warn!("mux write failed, reconnecting: {}", err);
                    *stream = net::connect_with_retry(&self.mux_target, self.connect_retry);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    use ntest::timeout;

    #[test]
    #[timeout(30000)]
    fn ship_out_forwards_reads_as_datagrams() {
        let diode_exit = UdpSocket::bind("127.0.0.1:0").expect("binding receiver");
        let diode_addr = diode_exit.local_addr().expect("receiver addr");

        let ship = ShipOut::bind(ShipOutOpts {
            port: 0,
            ddout_host: diode_addr.ip().to_string(),
            ddout_port: diode_addr.port(),
        })
        .expect("binding ship-out");
        let mux_addr = ship.local_addr().expect("ship addr");
        thread::spawn(move || ship.serve());

        let mut mux = TcpStream::connect(mux_addr).expect("connecting as mux");
        mux.write_all(b"9.GMS_START,4.AB12;4.ping,0.;7.GMS_END,4.AB12;")
            .expect("writing frame");

        let mut buf = vec![0u8; consts::SHIP_MTU];
        let (len, _) = diode_exit.recv_from(&mut buf).expect("receiving datagram");
        assert_eq!(&buf[..len], b"9.GMS_START,4.AB12;4.ping,0.;7.GMS_END,4.AB12;");
    }

    #[test]
    #[timeout(30000)]
    fn ship_in_validates_and_reassembles() {
        let mux_listener = TcpListener::bind("127.0.0.1:0").expect("binding mux stub");
        let mux_addr = mux_listener.local_addr().expect("mux addr");

        let ship = ShipIn::bind(
            ShipInOpts {
                ddin_port: 0,
                gmx_host: mux_addr.ip().to_string(),
                gmx_port: mux_addr.port(),
                no_validate: false,
            },
            8192,
            time::Duration::from_millis(100),
        )
        .expect("binding ship-in");
        let udp_addr = ship.udp_addr().expect("udp addr");
        thread::spawn(move || ship.serve());

        let (mut mux_conn, _) = mux_listener.accept().expect("accepting mux conn");

        let sender = UdpSocket::bind("127.0.0.1:0").expect("binding sender");
        // garbage dies at the boundary, a split instruction survives it
        sender
            .send_to(b"<<not guacamole>>", ("127.0.0.1", udp_addr.port()))
            .expect("sending garbage");
        sender.send_to(b"5.mouse,1.0", ("127.0.0.1", udp_addr.port())).expect("sending head");
        sender
            .send_to(b",3.100,3.200;", ("127.0.0.1", udp_addr.port()))
            .expect("sending tail");

        let mut got = vec![0u8; b"5.mouse,1.0,3.100,3.200;".len()];
        mux_conn.read_exact(&mut got).expect("reading forwarded instruction");
        assert_eq!(got, b"5.mouse,1.0,3.100,3.200;".to_vec());
    }

    #[test]
    #[timeout(30000)]
    fn ship_in_passthrough_when_validation_is_off() {
        let mux_listener = TcpListener::bind("127.0.0.1:0").expect("binding mux stub");
        let mux_addr = mux_listener.local_addr().expect("mux addr");

        let ship = ShipIn::bind(
            ShipInOpts {
                ddin_port: 0,
                gmx_host: mux_addr.ip().to_string(),
                gmx_port: mux_addr.port(),
                no_validate: true,
            },
            8192,
            time::Duration::from_millis(100),
        )
        .expect("binding ship-in");
        let udp_addr = ship.udp_addr().expect("udp addr");
        thread::spawn(move || ship.serve());

        let (mut mux_conn, _) = mux_listener.accept().expect("accepting mux conn");

        let sender = UdpSocket::bind("127.0.0.1:0").expect("binding sender");
        sender
            .send_to(b"<<not guacamole>>", ("127.0.0.1", udp_addr.port()))
            .expect("sending garbage");

        let mut got = vec![0u8; b"<<not guacamole>>".len()];
        mux_conn.read_exact(&mut got).expect("reading forwarded bytes");
        assert_eq!(got, b"<<not guacamole>>".to_vec());
    }
}
