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

use std::fmt;

use anyhow::anyhow;

/// A 128 bit id rendered as uppercase hex never exceeds 32 characters,
/// and nothing longer is accepted off the wire.
pub const MAX_SESSION_ID_LEN: usize = 32;

/// The identity of one front-end <-> guacd channel.
///
/// Generated by the server mux when a front-end connects, propagated to
/// the client mux in `GMS_NEW`, and named in every `GMS_START`/`GMS_END`/
/// `GMS_CLOSE` thereafter. Ids are opaque and not secret; they cross the
/// diode in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Draw a fresh id: 128 random bits as uppercase hex. The caller is
    /// responsible for re-drawing on a registry collision.
    pub fn generate() -> Self {
        SessionId(format!("{:X}", rand::random::<u128>()))
    }

    /// Parse an id received as an envelope argument. The grammar allows
    /// arbitrary bytes in the value, so this is where shape is enforced.
    pub fn from_wire(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.is_empty() || bytes.len() > MAX_SESSION_ID_LEN {
            return Err(anyhow!("session id length {} out of range", bytes.len()));
        }
        if !bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
            return Err(anyhow!("session id contains non-alphanumeric bytes"));
        }
        let id = String::from_utf8(bytes.to_vec())
            .map_err(|_| anyhow!("session id is not valid utf8"))?;
        Ok(SessionId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
