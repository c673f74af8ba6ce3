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

//! Spec section 4.5: translate `CHLD`/`TERM`/`HUP`/`WINCH`/`CONT` into
//! either a local action or an outgoing control message, depending on
//! whether the client is attached.
//!
//! The teacher's own signal handling (`daemon::signals::Handler`) runs a
//! dedicated thread reading from a `signal_hook::iterator::Signals`
//! iterator, which is fine for its "clean up and exit" use case but isn't
//! safe here: section 4.5 requires that signal delivery never race the
//! event loop's own use of the transport, and section 5 folds signal
//! delivery into the same single-threaded reactor as the transport and
//! stdin. So instead of a background thread we register raw handlers via
//! `signal_hook::low_level::register` that only set an atomic flag and
//! write a wakeup byte to a self-pipe; the event loop polls the pipe's
//! read end alongside everything else and drains+dispatches once woken.

use std::{
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use nix::{
    sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd::{self, Pid},
};
use shellmux_protocol::MsgType;
use tracing::warn;

use crate::context::{ClientContext, ClientState, ExitReason};

/// The job-control stop signal sent to self on `Suspend`/used as the
/// disposition target for `CONT` handling. `SIGTSTP` is what a user's `^Z`
/// actually raises; the teacher's tty code already treats job control as
/// tty-adjacent, so this lives alongside `SignalBridge` rather than in
/// `tty.rs`.
const STOP_SIGNAL: Signal = Signal::SIGTSTP;

#[derive(Default)]
struct Flags {
    chld: AtomicBool,
    term: AtomicBool,
    hup: AtomicBool,
    winch: AtomicBool,
    cont: AtomicBool,
}

pub struct SignalBridge {
    read_fd: OwnedFd,
    // Keep the write end alive; if it's dropped, the handler's stashed raw
    // fd would point at a closed descriptor.
    _write_fd: OwnedFd,
    flags: Arc<Flags>,
    _ids: Vec<signal_hook::SigId>,
}

impl SignalBridge {
    /// Registers handlers for all five signals of interest. `CHLD` is
    /// installed first and unconditionally, so that a `daemon`-style
    /// server spawn earlier in `SocketBringup` never leaves a zombie
    /// unreaped, per spec section 4.5.
    pub fn install() -> anyhow::Result<Self> {
        let (read_fd, write_fd) = unistd::pipe().context("creating signal self-pipe")?;
        crate::tty::set_nonblocking(read_fd.as_raw_fd())?;
        crate::tty::set_nonblocking(write_fd.as_raw_fd())?;

        let flags = Arc::new(Flags::default());
        let wake_fd = write_fd.as_raw_fd();

        let mut ids = Vec::with_capacity(5);
        ids.push(register(signal_hook::consts::SIGCHLD, Arc::clone(&flags), wake_fd, |f| &f.chld)?);
        ids.push(register(signal_hook::consts::SIGTERM, Arc::clone(&flags), wake_fd, |f| &f.term)?);
        ids.push(register(signal_hook::consts::SIGHUP, Arc::clone(&flags), wake_fd, |f| &f.hup)?);
        ids.push(register(signal_hook::consts::SIGWINCH, Arc::clone(&flags), wake_fd, |f| &f.winch)?);
        ids.push(register(signal_hook::consts::SIGCONT, Arc::clone(&flags), wake_fd, |f| &f.cont)?);

        Ok(SignalBridge { read_fd, _write_fd: write_fd, flags, _ids: ids })
    }

    pub fn poll_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// Drains the self-pipe (there may be several wakeup bytes queued up
    /// for one or several signals) and returns which signals fired since
    /// the last call.
    fn drain(&self) -> Pending {
        let mut buf = [0u8; 256];
        loop {
            match unistd::read(self.read_fd.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!("error draining signal self-pipe: {}", e);
                    break;
                }
            }
        }

        Pending {
            chld: self.flags.chld.swap(false, Ordering::SeqCst),
            term: self.flags.term.swap(false, Ordering::SeqCst),
            hup: self.flags.hup.swap(false, Ordering::SeqCst),
            winch: self.flags.winch.swap(false, Ordering::SeqCst),
            cont: self.flags.cont.swap(false, Ordering::SeqCst),
        }
    }

    /// Drains pending signals and applies the table from spec section 4.5.
    /// Called by the event loop once `poll_fd()` reports readable.
    pub fn dispatch(&self, ctx: &mut ClientContext) -> anyhow::Result<()> {
        let pending = self.drain();

        if pending.chld {
            reap_zombies();
        }

        if ctx.state == ClientState::Attached {
            if pending.hup {
                ctx.transition_to_exiting(ExitReason::LostTty);
                ctx.exit_code = 1;
                ctx.transport.send(MsgType::Exiting, &[]).context("sending Exiting for HUP")?;
            }
            if pending.term {
                ctx.transition_to_exiting(ExitReason::Terminated);
                ctx.exit_code = 1;
                ctx.transport.send(MsgType::Exiting, &[]).context("sending Exiting for TERM")?;
            }
            if pending.winch {
                let size = crate::tty::size_from_fd(std::io::stdin().as_raw_fd())?;
                ctx.transport.send(MsgType::Resize, &size.encode()).context("sending Resize")?;
            }
            if pending.cont {
                install_ignore_stop_signal().context("installing ignore disposition for CONT")?;
                ctx.transport.send(MsgType::Wakeup, &[]).context("sending Wakeup")?;
            }
        } else if ctx.state == ClientState::Wait && pending.term {
            // Section 4.5 only says "initiate immediate exit" here, but
            // section 7 states signal-driven exits carry exit code 1; we
            // follow section 7 since there's no reason TERM should be the
            // one signal-driven exit that reports success.
            ctx.transition_to_exiting(ExitReason::None);
            ctx.exit_code = 1;
        }

        Ok(())
    }
}

struct Pending {
    chld: bool,
    term: bool,
    hup: bool,
    winch: bool,
    cont: bool,
}

fn register(
    sig: i32,
    flags: Arc<Flags>,
    wake_fd: RawFd,
    select: fn(&Flags) -> &AtomicBool,
) -> anyhow::Result<signal_hook::SigId> {
    // Safety: the closure only performs async-signal-safe operations (an
    // atomic store and a `write(2)` of a fixed-size buffer), per spec
    // section 4.5 and section 9's requirement that handlers never do more
    // than flag-setting or self-pipe writes.
    let id = unsafe {
        signal_hook::low_level::register(sig, move || {
            select(&flags).store(true, Ordering::SeqCst);
            let _ = unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(wake_fd) }, &[0u8]);
        })
    }
    .with_context(|| format!("registering handler for signal {}", sig))?;
    Ok(id)
}

fn reap_zombies() {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("error reaping children: {}", e);
                break;
            }
        }
    }
}

/// `Suspend` handling from the Attached message table (spec section 4.4):
/// put the stop signal back to its default disposition, then self-send it.
/// Resumption (`SIGCONT`) is handled by `dispatch` above re-installing the
/// ignore disposition, the inverse of this function.
pub fn suspend_self() -> anyhow::Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe { signal::sigaction(STOP_SIGNAL, &default) }.context("restoring default stop disposition")?;
    signal::raise(STOP_SIGNAL).context("raising stop signal")?;
    Ok(())
}

fn install_ignore_stop_signal() -> anyhow::Result<()> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::SA_RESTART, SigSet::empty());
    unsafe { signal::sigaction(STOP_SIGNAL, &ignore) }.context("installing ignore stop disposition")?;
    Ok(())
}
