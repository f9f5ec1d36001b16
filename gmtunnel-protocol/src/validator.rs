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

use std::{collections::VecDeque, mem};

use tracing::warn;

use crate::instruction::Instruction;

/// Upper bound on the size of a single instruction. Anything larger is
/// discarded; real Guacamole traffic (including image blobs) stays well
/// under this.
pub const DEFAULT_MAX_INSTRUCTION_SIZE: usize = 20 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting the first digit of an element length.
    Start,
    /// Accumulating length digits until the `.`.
    Length,
    /// Consuming value bytes, then the `,` or `;` separator.
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    Opcode,
    Argument,
}

/// A byte-level state machine that re-segments an arbitrary stream of
/// chunks into whole Guacamole instructions and rejects anything that
/// does not match the grammar.
///
/// One validator services exactly one ingress byte stream; chunk
/// boundaries may fall anywhere (mid-length, mid-value, between
/// separators) without affecting the emitted instructions. On a syntax
/// error the in-progress instruction is discarded and the machine
/// resynchronizes at the next digit; the connection stays up, that call
/// is the caller's to make.
#[derive(Debug)]
pub struct Validator {
    state: State,
    element: Element,
    length_digits: String,
    remaining: usize,
    raw: Vec<u8>,
    max_instruction: usize,
    resyncing: bool,
    discarding: bool,
    ready: VecDeque<Instruction>,
}

impl Validator {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_INSTRUCTION_SIZE)
    }

    pub fn with_limit(max_instruction: usize) -> Self {
        Validator {
            state: State::Start,
            element: Element::Opcode,
            length_digits: String::new(),
            remaining: 0,
            raw: Vec::new(),
            max_instruction,
            resyncing: false,
            discarding: false,
            ready: VecDeque::new(),
        }
    }

    /// Consume one chunk read off a socket. Whole instructions contained
    /// in it (possibly completed by earlier chunks) become available from
    /// [`Validator::next_instruction`].
    pub fn feed(&mut self, data: &[u8]) {
        for &b in data {
            self.push_byte(b);
        }
    }

    /// Pop the next completed instruction, in the order the bytes arrived.
    pub fn next_instruction(&mut self) -> Option<Instruction> {
        self.ready.pop_front()
    }

    fn push_byte(&mut self, b: u8) {
        match self.state {
            State::Start => {
                if b.is_ascii_digit() {
                    if self.element == Element::Opcode {
                        self.raw.clear();
                        self.discarding = false;
                    }
                    self.resyncing = false;
                    self.buffer(b);
                    self.length_digits.clear();
                    self.length_digits.push(b as char);
                    self.state = State::Length;
                } else {
                    self.fail("expected a digit to start an element", b);
                }
            }
            State::Length => {
                if b.is_ascii_digit() {
                    // no in-range length needs anywhere near this many
                    // digits, and an endless digit run must not pin memory
                    if self.length_digits.len() >= 10 {
                        self.fail("element length has too many digits", b);
                        return;
                    }
                    self.buffer(b);
                    self.length_digits.push(b as char);
                } else if b == b'.' {
                    self.buffer(b);
                    match self.length_digits.parse::<usize>() {
                        Ok(n) if n <= self.max_instruction => {
                            self.remaining = n;
                            self.state = State::Value;
                        }
                        _ => self.fail("element length out of range", b),
                    }
                } else {
                    self.fail("expected a digit or '.' in an element length", b);
                }
            }
            State::Value => {
                if self.remaining > 0 {
                    self.buffer(b);
                    self.remaining -= 1;
                } else if b == b',' {
                    self.buffer(b);
                    self.element = Element::Argument;
                    self.state = State::Start;
                } else if b == b';' {
                    self.buffer(b);
                    if self.discarding {
                        warn!(
                            "dropping instruction larger than {} bytes",
                            self.max_instruction
                        );
                        self.raw.clear();
                        self.discarding = false;
                    } else {
                        self.ready.push_back(Instruction::from_raw(mem::take(&mut self.raw)));
                    }
                    self.element = Element::Opcode;
                    self.state = State::Start;
                } else {
                    self.fail("expected ',' or ';' after a value", b);
                }
            }
        }
    }

    fn buffer(&mut self, b: u8) {
        // Keep parsing oversize instructions so the stream stays framed,
        // but stop retaining their bytes; they are dropped at the `;`.
        if self.raw.len() >= self.max_instruction {
            self.discarding = true;
        }
        if !self.discarding {
            self.raw.push(b);
        }
    }

    fn fail(&mut self, reason: &str, b: u8) {
        // A burst of garbage produces a single log line; every byte until
        // the next digit is dropped silently.
        if !self.resyncing {
            warn!("invalid guacamole input, resyncing: {} (byte {:#04x})", reason, b);
            self.resyncing = true;
        }
        self.raw.clear();
        self.length_digits.clear();
        self.remaining = 0;
        self.element = Element::Opcode;
        self.discarding = false;
        self.state = State::Start;
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
