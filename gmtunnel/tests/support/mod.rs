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
#![allow(dead_code)]

use std::{
    io::Read,
    net::{TcpListener, TcpStream},
    time,
};

use anyhow::{anyhow, Context};
use gmtunnel_protocol::{Instruction, Validator};
use libgmtunnel::Tunables;

/// Mux knobs for tests: small caps, fast reconnects, no heartbeat
/// unless the test asks for one.
pub fn tunables() -> Tunables {
    Tunables {
        max_instruction_size: 8192,
        batch_size: 8192,
        queue_capacity: 256,
        heartbeat: time::Duration::ZERO,
        connect_retry: time::Duration::from_millis(100),
    }
}

/// Stands in for the forward shipper: the mux under test dials us and
/// writes its framed egress stream at us.
pub struct ShipOutStub {
    listener: TcpListener,
}

impl ShipOutStub {
    pub fn bind() -> anyhow::Result<Self> {
        let listener =
            TcpListener::bind("127.0.0.1:0").context("binding ship-out stub listener")?;
        Ok(ShipOutStub { listener })
    }

    /// The (host, port) pair to hand to the mux as its egress target.
    pub fn target(&self) -> anyhow::Result<(String, u16)> {
        let addr = self.listener.local_addr().context("ship-out stub addr")?;
        Ok((addr.ip().to_string(), addr.port()))
    }

    pub fn accept(&self) -> anyhow::Result<InstructionStream> {
        let (stream, _) = self.listener.accept().context("accepting mux egress connection")?;
        InstructionStream::new(stream)
    }
}

/// Reads a TCP stream instruction by instruction so tests can assert on
/// framing without caring how the bytes were chunked in flight.
pub struct InstructionStream {
    stream: TcpStream,
    validator: Validator,
}

impl InstructionStream {
    pub fn new(stream: TcpStream) -> anyhow::Result<Self> {
        Ok(InstructionStream { stream, validator: Validator::new() })
    }

    pub fn next(&mut self) -> anyhow::Result<Instruction> {
        self.next_timeout(time::Duration::from_secs(5))
    }

    pub fn next_timeout(&mut self, timeout: time::Duration) -> anyhow::Result<Instruction> {
        self.stream
            .set_read_timeout(Some(timeout))
            .context("setting read timeout on instruction stream")?;

        let mut buf = [0u8; 4096];
        loop {
            if let Some(instruction) = self.validator.next_instruction() {
                return Ok(instruction);
            }
            let len = self.stream.read(&mut buf).context("reading instruction stream")?;
            if len == 0 {
                return Err(anyhow!("stream closed while waiting for an instruction"));
            }
            self.validator.feed(&buf[..len]);
        }
    }

    /// Asserts that nothing more arrives within the window.
    pub fn expect_quiet(&mut self, window: time::Duration) -> anyhow::Result<()> {
        match self.next_timeout(window) {
            Ok(instruction) => Err(anyhow!(
                "expected a quiet stream but got '{}'",
                String::from_utf8_lossy(instruction.as_bytes())
            )),
            Err(_) => Ok(()),
        }
    }
}

/// Render one instruction in wire form.
pub fn instruction(opcode: &str, args: &[&str]) -> Vec<u8> {
    let mut out = format!("{}.{}", opcode.len(), opcode);
    for arg in args {
        out.push(',');
        out.push_str(&format!("{}.{}", arg.len(), arg));
    }
    out.push(';');
    out.into_bytes()
}
