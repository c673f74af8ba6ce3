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

//! The "server-start" collaborator from spec section 6: called with
//! `(lock_fd, lockfile_path)`, returns an already-connected socket to a
//! freshly daemonized server. The server is responsible for
//! releasing/unlinking the lock once it is listening.
//!
//! The daemon itself is out of scope for this crate (spec section 1's
//! Non-goals), so the production implementation here just execs a
//! configured server binary and polls for it to come up, the way the
//! teacher's `daemonize::maybe_fork_daemon` polls a freshly spawned
//! `shpool daemon` process.

use std::{
    os::fd::{OwnedFd, RawFd},
    path::{Path, PathBuf},
    process, thread, time,
};

use anyhow::{anyhow, Context};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tracing::info;

use crate::{consts, transport::Transport};

pub trait ServerStarter {
    fn start(&self, lock_fd: RawFd, lockfile_path: &Path, socket_path: &Path) -> anyhow::Result<OwnedFd>;
}

/// Daemonizes `server_bin`, handing it the lock fd (as an inherited fd
/// number passed on argv) and lockfile path so it can release/unlink them
/// once it has bound its listening socket, then polls with exponential
/// backoff until the socket is dialable, mirroring the teacher's
/// `maybe_fork_daemon`.
pub struct ProcessServerStart {
    pub server_bin: PathBuf,
    pub connect_timeout: time::Duration,
}

impl ServerStarter for ProcessServerStart {
    fn start(&self, lock_fd: RawFd, lockfile_path: &Path, socket_path: &Path) -> anyhow::Result<OwnedFd> {
        info!("no daemon running on {:?}, spawning {:?}", socket_path, self.server_bin);

        // `OpenOptions` always opens with `O_CLOEXEC`, which would otherwise
        // close `lock_fd` in the child across its `exec` before the server
        // ever gets to use the fd number we're about to hand it on argv.
        // Clear the flag so the descriptor survives the spawn.
        fcntl(lock_fd, FcntlArg::F_SETFD(FdFlag::empty()))
            .context("clearing FD_CLOEXEC on the start-lock fd")?;

        process::Command::new(&self.server_bin)
            .arg("--socket")
            .arg(socket_path)
            .arg("--release-lock-fd")
            .arg(lock_fd.to_string())
            .arg("--release-lock-file")
            .arg(lockfile_path)
            .env(consts::AUTODAEMONIZE_VAR, "true")
            .stdout(process::Stdio::null())
            .stderr(process::Stdio::null())
            .spawn()
            .context("launching background server")?;

        let mut sleep_ms = 10;
        let max_sleep_ms = 2000;
        let deadline = time::Instant::now() + self.connect_timeout;
        loop {
            match Transport::connect(socket_path) {
                Ok(fd) => return Ok(fd),
                Err(_) if time::Instant::now() < deadline => {
                    thread::sleep(time::Duration::from_millis(sleep_ms));
                    sleep_ms = (sleep_ms * 2).min(max_sleep_ms);
                }
                Err(e) => {
                    return Err(anyhow!(
                        "launched server but control socket never came up: {}",
                        e
                    ))
                }
            }
        }
    }
}
