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

use std::mem;

use crate::{envelope::Envelope, instruction::Instruction, session_id::SessionId};

/// Groups consecutive whole instructions from one session between a
/// `GMS_START id` and a matching `GMS_END id`, so the peer mux can route
/// them without tagging every instruction individually.
///
/// Owned by a single per-session reader, which pushes instructions in
/// the order it saw them and flushes whenever its validator runs dry;
/// a full buffer flushes on its own. Instruction order within and across
/// batches is exactly arrival order.
#[derive(Debug)]
pub struct Batch {
    id: SessionId,
    max_bytes: usize,
    buf: Vec<u8>,
}

impl Batch {
    pub fn new(id: SessionId, max_bytes: usize) -> Self {
        Batch { id, max_bytes, buf: Vec::new() }
    }

    /// Append one instruction. If the buffer cannot take it, the filled
    /// batch is returned (terminated with `GMS_END`) and the instruction
    /// opens the next one.
    pub fn push(&mut self, instruction: &Instruction) -> Option<Vec<u8>> {
        let mut filled = None;
        if !self.buf.is_empty() && self.buf.len() + instruction.len() > self.max_bytes {
            filled = self.flush();
        }
        if self.buf.is_empty() {
            self.buf.extend_from_slice(&Envelope::Start(self.id.clone()).encode());
        }
        self.buf.extend_from_slice(instruction.as_bytes());
        filled
    }

    /// Terminate and hand back the pending batch, if any.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            return None;
        }
        self.buf.extend_from_slice(&Envelope::End(self.id.clone()).encode());
        Some(mem::take(&mut self.buf))
    }
}
