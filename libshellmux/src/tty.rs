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

use std::{
    ffi::CStr,
    io,
    os::unix::io::{AsRawFd, BorrowedFd, RawFd},
};

use anyhow::Context;
use nix::{
    sys::{
        termios,
        termios::{ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg},
    },
    unistd::isatty,
};
use shellmux_protocol::TtySize;
use tracing::error;

// see `man ioctl_tty` for info on these ioctl commands
nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);

/// Returns the terminal size for the given fd, for use in the outbound
/// `Resize` frame.
pub fn size_from_fd(fd: RawFd) -> anyhow::Result<TtySize> {
    let mut term_size = libc::winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };

    // Safety: term_size is stack allocated and lives for the whole call.
    unsafe {
        tiocgwinsz(fd, &mut term_size).context("fetching term size")?;
    }

    Ok(TtySize { rows: term_size.ws_row, cols: term_size.ws_col })
}

/// Returns the name of the controlling tty for `fd`, or `None` if `fd` is
/// not a tty. Used by `IdentifyTtyName`.
pub fn name_of(fd: RawFd) -> Option<String> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    if !isatty(borrowed).ok()? {
        return None;
    }
    unsafe {
        let ptr = libc::ttyname(fd);
        if ptr.is_null() {
            return None;
        }
        Some(String::from_utf8_lossy(CStr::from_ptr(ptr).to_bytes()).into_owned())
    }
}

/// RAII guard that puts the attach-time terminal into raw mode and restores
/// the saved attributes when dropped. Only constructed when the client is
/// actually attached to a real terminal; the `CONTROLCONTROL` restore step
/// in the Terminator reuses the same guard.
pub struct AttachFlagsGuard {
    fd: RawFd,
    old: Option<termios::Termios>,
}

pub fn set_attach_flags() -> anyhow::Result<AttachFlagsGuard> {
    let fd = io::stdin().as_raw_fd();
    let stdin = unsafe { BorrowedFd::borrow_raw(fd) };
    let stdout = unsafe { BorrowedFd::borrow_raw(io::stdout().as_raw_fd()) };

    if !isatty(stdin)? || !isatty(stdout)? {
        // We are not attached to a terminal, so don't futz with its flags.
        return Ok(AttachFlagsGuard { fd, old: None });
    }

    let old = termios::tcgetattr(stdin).context("grabbing term flags")?;

    let mut new = old.clone();
    new.input_flags &= !(InputFlags::IGNBRK
        | InputFlags::BRKINT
        | InputFlags::PARMRK
        | InputFlags::ISTRIP
        | InputFlags::INLCR
        | InputFlags::IGNCR
        | InputFlags::ICRNL
        | InputFlags::IXON);
    new.output_flags &= !OutputFlags::OPOST;
    new.local_flags &= !(LocalFlags::ECHO
        | LocalFlags::ECHONL
        | LocalFlags::ICANON
        | LocalFlags::ISIG
        | LocalFlags::IEXTEN);
    new.control_flags &= !(ControlFlags::CSIZE | ControlFlags::PARENB);
    new.control_flags |= ControlFlags::CS8;
    termios::tcsetattr(stdin, SetArg::TCSANOW, &new)?;

    Ok(AttachFlagsGuard { fd, old: Some(old) })
}

impl std::ops::Drop for AttachFlagsGuard {
    fn drop(&mut self) {
        if let Some(old) = &self.old {
            let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
            if let Err(e) = termios::tcsetattr(fd, SetArg::TCSANOW, old) {
                error!("error restoring terminal settings: {:?}", e);
            }
        }
    }
}

/// Puts `fd` back into blocking mode, undoing whatever `O_NONBLOCK` the
/// event loop set. Used by the Terminator before handing stdio to an
/// `exec`ed shell.
pub fn set_blocking(fd: RawFd) -> anyhow::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL).context("getting fd flags")?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.remove(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).context("clearing O_NONBLOCK")?;
    Ok(())
}

/// Puts `fd` into non-blocking mode. Used for the stdin reader and the
/// signal self-pipe's two ends.
pub fn set_nonblocking(fd: RawFd) -> anyhow::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL).context("getting fd flags")?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).context("setting O_NONBLOCK")?;
    Ok(())
}
