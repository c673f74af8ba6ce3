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

//! Spec section 4.6: a non-blocking reader on standard input, folded into
//! the single reactor the event loop runs instead of the teacher's
//! dedicated `pipe_bytes` thread pair (`attach.rs`'s stdin->sock worker).
//! That model suits a streaming proxy; this client also has to interleave
//! stdin with transport messages and signals in the order section 5
//! requires, so it reads on its own turn of the loop rather than a
//! separate thread.

use std::{
    io::{self, Read},
    os::fd::{AsRawFd, RawFd},
};

use anyhow::Context;
use shellmux_protocol::MsgType;

use crate::{consts::BUF_SIZE, context::ClientContext};

/// Tracks whether the reader is currently enabled; the server can disable
/// it (implicitly, by not granting flow control) and re-enable it later
/// via an inbound `Stdin` control frame (section 4.4).
pub struct StdinPump {
    enabled: bool,
}

impl StdinPump {
    pub fn new() -> anyhow::Result<Self> {
        crate::tty::set_nonblocking(io::stdin().as_raw_fd()).context("setting stdin non-blocking")?;
        Ok(StdinPump { enabled: true })
    }

    pub fn fd(&self) -> RawFd {
        io::stdin().as_raw_fd()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Called when `poll` reports stdin readable and the pump is enabled.
    /// Reads once; on EOF or a hard error, sends the zero-length
    /// terminator frame and disables itself, since the server reads
    /// `size <= 0` as "standard input is closed".
    pub fn on_readable(&mut self, ctx: &mut ClientContext) -> anyhow::Result<()> {
        let mut buf = vec![0u8; BUF_SIZE];
        match io::stdin().read(&mut buf) {
            Ok(0) => {
                ctx.transport.send(MsgType::Stdin, &[]).context("sending Stdin EOF terminator")?;
                self.disable();
            }
            Ok(n) => {
                ctx.transport.send(MsgType::Stdin, &buf[..n]).context("sending Stdin")?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted || e.kind() == io::ErrorKind::WouldBlock => {
                // Nothing to do; the next readable event will retry.
            }
            Err(_) => {
                ctx.transport.send(MsgType::Stdin, &[]).context("sending Stdin error terminator")?;
                self.disable();
            }
        }
        Ok(())
    }
}
