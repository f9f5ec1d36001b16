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

use anyhow::anyhow;

use crate::{instruction::Instruction, session_id::SessionId};

const ENVELOPE_PREFIX: &[u8] = b"GMS_";

/// The session-scoping messages layered on top of the Guacamole grammar.
///
/// Each envelope message is itself an ordinary Guacamole instruction
/// whose opcode starts with `GMS_`, so the same validator that frames
/// session traffic also frames (and polices) the envelope on the diode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// A front-end connected; the client mux must open a guacd
    /// connection tagged with this id.
    New(SessionId),
    /// Begins a batch of instructions belonging to the named session.
    Start(SessionId),
    /// Ends the batch opened by the matching `Start`.
    End(SessionId),
    /// The session is dead; the receiver must tear down its end.
    Close(SessionId),
    /// Liveness marker, a no-op on receipt.
    Heartbeat,
}

impl Envelope {
    /// True if the validated instruction belongs to the envelope layer
    /// rather than to a session's Guacamole traffic.
    pub fn is_envelope(instruction: &Instruction) -> bool {
        instruction.opcode().starts_with(ENVELOPE_PREFIX)
    }

    /// Decode an envelope instruction. Only call after `is_envelope`;
    /// failures (unknown opcode, missing or malformed id) mean the
    /// instruction should be logged and dropped.
    pub fn decode(instruction: &Instruction) -> anyhow::Result<Envelope> {
        let id = || {
            let bytes = instruction
                .arg(0)
                .ok_or_else(|| anyhow!("envelope instruction is missing its session id"))?;
            SessionId::from_wire(bytes)
        };

        match instruction.opcode() {
            b"GMS_NEW" => Ok(Envelope::New(id()?)),
            b"GMS_START" => Ok(Envelope::Start(id()?)),
            b"GMS_END" => Ok(Envelope::End(id()?)),
            b"GMS_CLOSE" => Ok(Envelope::Close(id()?)),
            b"GMS_HEARTBEAT" => Ok(Envelope::Heartbeat),
            opcode => Err(anyhow!(
                "unknown envelope opcode '{}'",
                String::from_utf8_lossy(opcode)
            )),
        }
    }

    /// Render the message as a single well formed Guacamole instruction.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Envelope::New(id) => encode_with_id("GMS_NEW", id),
            Envelope::Start(id) => encode_with_id("GMS_START", id),
            Envelope::End(id) => encode_with_id("GMS_END", id),
            Envelope::Close(id) => encode_with_id("GMS_CLOSE", id),
            Envelope::Heartbeat => b"13.GMS_HEARTBEAT;".to_vec(),
        }
    }
}

fn encode_with_id(opcode: &str, id: &SessionId) -> Vec<u8> {
    format!("{}.{},{}.{};", opcode.len(), opcode, id.as_str().len(), id.as_str()).into_bytes()
}
