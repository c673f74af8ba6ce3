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

//! Spec section 4.3: the ordered identity burst sent right after the
//! transport comes up. Order matters, so this is a straight-line function
//! rather than a table-driven dispatcher.

use std::{
    env,
    io,
    os::fd::AsRawFd,
};

use anyhow::Context;
use nix::unistd::{dup, getpid};
use shellmux_protocol::{encode_cstr, MsgType};

use crate::context::ClientContext;

pub fn run(ctx: &mut ClientContext) -> anyhow::Result<()> {
    ctx.transport
        .send(MsgType::IdentifyFlags, &ctx.flags.as_word().to_le_bytes())
        .context("sending IdentifyFlags")?;

    let term = env::var("TERM").unwrap_or_default();
    ctx.transport
        .send(MsgType::IdentifyTerm, &encode_cstr(&term))
        .context("sending IdentifyTerm")?;

    let tty_name = crate::tty::name_of(io::stdin().as_raw_fd()).unwrap_or_default();
    ctx.transport
        .send(MsgType::IdentifyTtyName, &encode_cstr(&tty_name))
        .context("sending IdentifyTtyName")?;

    let cwd = current_dir_or_fallback();
    ctx.transport
        .send(MsgType::IdentifyCwd, &encode_cstr(&cwd))
        .context("sending IdentifyCwd")?;

    // Duplicate stdin so the server gets its own handle; ours stays open and
    // usable for the rest of the attached session.
    let stdin_dup = dup(io::stdin().as_raw_fd()).context("duplicating stdin")?;
    let send_result = ctx.transport.send_with_fd(MsgType::IdentifyStdin, &[], Some(stdin_dup.as_raw_fd()));
    // The dup'd fd was sent (or the attempt failed); either way we don't
    // need our copy of it once send_with_fd returns; sendmsg itself dup's
    // the descriptor across the boundary, so closing ours is safe.
    drop(stdin_dup);
    send_result.context("sending IdentifyStdin")?;

    ctx.transport
        .send(MsgType::IdentifyClientPid, &getpid().as_raw().to_le_bytes())
        .context("sending IdentifyClientPid")?;

    for (key, value) in env::vars() {
        let entry = format!("{}={}", key, value);
        let payload = encode_cstr(&entry);
        // Entries whose serialized size exceeds the transport's per-frame
        // limit minus header are silently skipped, per spec section 4.3.
        if payload.len() > crate::consts::MAX_FRAME_PAYLOAD {
            continue;
        }
        ctx.transport.send(MsgType::IdentifyEnviron, &payload).context("sending IdentifyEnviron")?;
    }

    ctx.transport.send(MsgType::IdentifyDone, &[]).context("sending IdentifyDone")?;
    Ok(())
}

fn current_dir_or_fallback() -> String {
    if let Ok(dir) = env::current_dir() {
        return dir.to_string_lossy().into_owned();
    }
    if let Ok(home) = env::var("HOME") {
        return home;
    }
    "/".to_string()
}
