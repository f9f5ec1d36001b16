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

//! The wire layer shared by every gmtunnel role. A Guacamole connection
//! is a stream of textual instructions of the form
//! `L1.V1,L2.V2,...,Ln.Vn;` where each `L` is the decimal byte length of
//! the `V` that follows it. This crate owns parsing and re-framing that
//! stream ([`Validator`]), the per-session envelope layered on top of it
//! ([`Envelope`]), and session identity ([`SessionId`]). It performs no
//! I/O of its own.

mod batch;
mod envelope;
mod instruction;
mod session_id;
mod validator;

pub use batch::Batch;
pub use envelope::Envelope;
pub use instruction::Instruction;
pub use session_id::{SessionId, MAX_SESSION_ID_LEN};
pub use validator::{Validator, DEFAULT_MAX_INSTRUCTION_SIZE};
