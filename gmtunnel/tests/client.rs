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
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread, time,
};

use anyhow::Context;
use ntest::timeout;

mod support;

use libgmtunnel::{
    client::{Client, ClientOpts},
    Tunables,
};

struct ClientFixture {
    ship_out: support::ShipOutStub,
    ingress_addr: SocketAddr,
}

fn start_client(guacd_addr: SocketAddr, tunables: Tunables) -> anyhow::Result<ClientFixture> {
    let ship_out = support::ShipOutStub::bind()?;
    let (ddout_host, ddout_port) = ship_out.target()?;

    let client = Client::bind(
        ClientOpts {
            guacd_host: guacd_addr.ip().to_string(),
            guacd_port: guacd_addr.port(),
            ddin_port: 0,
            ddout_host,
            ddout_port,
        },
        tunables,
    )
    .context("binding client mux")?;
    // the listener binds the wildcard address, dial it via loopback
    let ingress_addr = SocketAddr::from(([127, 0, 0, 1], client.ingress_addr()?.port()));
    thread::spawn(move || Client::serve(client));

    Ok(ClientFixture { ship_out, ingress_addr })
}

#[test]
#[timeout(30000)]
fn opens_guacd_connections_and_relays_both_ways() -> anyhow::Result<()> {
    let guacd = TcpListener::bind("127.0.0.1:0").context("binding guacd stub")?;
    let fixture = start_client(guacd.local_addr()?, support::tunables())?;

    let mut diode =
        TcpStream::connect(fixture.ingress_addr).context("connecting as reverse shipper")?;
    diode.write_all(b"7.GMS_NEW,4.AB12;").context("announcing the session")?;

    // the client dials guacd for the new session...
    let (mut guacd_conn, _) = guacd.accept().context("accepting guacd connection")?;

    // ...delivers the session's forward traffic with the envelope
    // stripped...
    diode
        .write_all(b"9.GMS_START,4.AB12;5.mouse,1.0,3.100,3.200;7.GMS_END,4.AB12;")
        .context("writing forward batch")?;
    guacd_conn.set_read_timeout(Some(time::Duration::from_secs(5)))?;
    let mut got = vec![0u8; b"5.mouse,1.0,3.100,3.200;".len()];
    guacd_conn.read_exact(&mut got).context("reading delivered bytes")?;
    assert_eq!(got, b"5.mouse,1.0,3.100,3.200;".to_vec());

    // ...and frames guacd's replies for the reverse diode
    guacd_conn.write_all(b"4.sync,2.17;").context("writing guacd reply")?;
    let mut egress = fixture.ship_out.accept()?;
    assert_eq!(egress.next()?.as_bytes(), b"9.GMS_START,4.AB12;");
    assert_eq!(egress.next()?.as_bytes(), b"4.sync,2.17;");
    assert_eq!(egress.next()?.as_bytes(), b"7.GMS_END,4.AB12;");

    // guacd hanging up produces exactly one GMS_CLOSE
    drop(guacd_conn);
    assert_eq!(egress.next()?.as_bytes(), b"9.GMS_CLOSE,4.AB12;");
    egress.expect_quiet(time::Duration::from_millis(500))?;

    Ok(())
}

#[test]
#[timeout(30000)]
fn replies_close_for_unknown_session_without_dialing_guacd() -> anyhow::Result<()> {
    let guacd = TcpListener::bind("127.0.0.1:0").context("binding guacd stub")?;
    let fixture = start_client(guacd.local_addr()?, support::tunables())?;

    let mut diode =
        TcpStream::connect(fixture.ingress_addr).context("connecting as reverse shipper")?;
    diode
        .write_all(b"9.GMS_START,4.XXXX;4.ping,0.;7.GMS_END,4.XXXX;")
        .context("writing unknown-session batch")?;

    let mut egress = fixture.ship_out.accept()?;
    assert_eq!(egress.next()?.as_bytes(), b"9.GMS_CLOSE,4.XXXX;");
    egress.expect_quiet(time::Duration::from_millis(500))?;

    // no guacd connection was opened and no ping was delivered
    guacd.set_nonblocking(true)?;
    assert!(guacd.accept().is_err(), "a guacd connection was opened for an unknown session");

    Ok(())
}

#[test]
#[timeout(30000)]
fn reports_close_when_guacd_is_unreachable() -> anyhow::Result<()> {
    // a port that had a listener a moment ago and doesn't any more
    let vacant = TcpListener::bind("127.0.0.1:0").context("binding throwaway listener")?;
    let guacd_addr = vacant.local_addr()?;
    drop(vacant);

    let fixture = start_client(guacd_addr, support::tunables())?;

    let mut diode =
        TcpStream::connect(fixture.ingress_addr).context("connecting as reverse shipper")?;
    diode.write_all(b"7.GMS_NEW,4.AB12;").context("announcing the session")?;

    let mut egress = fixture.ship_out.accept()?;
    assert_eq!(egress.next()?.as_bytes(), b"9.GMS_CLOSE,4.AB12;");

    Ok(())
}

#[test]
#[timeout(30000)]
fn ignores_duplicate_session_announcements() -> anyhow::Result<()> {
    let guacd = TcpListener::bind("127.0.0.1:0").context("binding guacd stub")?;
    let fixture = start_client(guacd.local_addr()?, support::tunables())?;

    let mut diode =
        TcpStream::connect(fixture.ingress_addr).context("connecting as reverse shipper")?;
    diode.write_all(b"7.GMS_NEW,4.AB12;").context("announcing the session")?;
    let (_guacd_conn, _) = guacd.accept().context("accepting guacd connection")?;

    diode.write_all(b"7.GMS_NEW,4.AB12;").context("re-announcing the session")?;

    // no close is reported and no second connection shows up
    let mut egress = fixture.ship_out.accept()?;
    egress.expect_quiet(time::Duration::from_millis(500))?;
    guacd.set_nonblocking(true)?;
    assert!(guacd.accept().is_err(), "a second guacd connection was opened");

    Ok(())
}

#[test]
#[timeout(30000)]
fn close_from_the_peer_tears_down_the_guacd_socket() -> anyhow::Result<()> {
    let guacd = TcpListener::bind("127.0.0.1:0").context("binding guacd stub")?;
    let fixture = start_client(guacd.local_addr()?, support::tunables())?;

    let mut diode =
        TcpStream::connect(fixture.ingress_addr).context("connecting as reverse shipper")?;
    diode.write_all(b"7.GMS_NEW,4.AB12;").context("announcing the session")?;
    let (mut guacd_conn, _) = guacd.accept().context("accepting guacd connection")?;

    diode.write_all(b"9.GMS_CLOSE,4.AB12;").context("closing the session")?;

    // the guacd socket closes out from under the stub
    guacd_conn.set_read_timeout(Some(time::Duration::from_secs(5)))?;
    let mut buf = [0u8; 1];
    let closed = match guacd_conn.read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) => err.kind() == std::io::ErrorKind::ConnectionReset,
    };
    assert!(closed, "guacd socket was not closed");

    // and the close is not echoed back over the diode
    let mut egress = fixture.ship_out.accept()?;
    egress.expect_quiet(time::Duration::from_millis(500))?;

    Ok(())
}

#[test]
#[timeout(30000)]
fn emits_heartbeats_when_configured() -> anyhow::Result<()> {
    let guacd = TcpListener::bind("127.0.0.1:0").context("binding guacd stub")?;
    let mut tunables = support::tunables();
    tunables.heartbeat = time::Duration::from_millis(50);
    let fixture = start_client(guacd.local_addr()?, tunables)?;

    let mut egress = fixture.ship_out.accept()?;
    assert_eq!(egress.next()?.as_bytes(), b"13.GMS_HEARTBEAT;");
    assert_eq!(egress.next()?.as_bytes(), b"13.GMS_HEARTBEAT;");

    Ok(())
}
