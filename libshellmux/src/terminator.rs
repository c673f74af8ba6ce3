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

//! Spec section 4.7: what happens after the event loop returns (or, for
//! the Wait-state `Shell` reply, in place of ever entering the loop at
//! all — both paths exec the same way, so `exec_shell` below is shared).

use std::{ffi::CString, io::Write};

use anyhow::Context;
use nix::{
    sys::signal::{self, Signal},
    unistd::{self, Pid},
};

use crate::context::{ClientContext, ExitType};

/// Runs after the event loop exits. Consumes `ctx` since nothing after
/// this point needs the client state again.
pub fn run(mut ctx: ClientContext) -> i32 {
    if ctx.exit_type == ExitType::Exec {
        let shell = ctx.exec_shell.take().unwrap_or_default();
        let command = ctx.exec_command.take().unwrap_or_default();
        if let Err(e) = exec_shell(&shell, &command, ctx.flags.login) {
            eprintln!("failed to exec shell: {:#}", e);
            return 1;
        }
        unreachable!("exec_shell only returns on error, which is mapped above");
    }

    let banner = ctx.exit_reason.banner();

    if ctx.was_attached {
        if let Some(msg) = &banner {
            println!("[{}]", msg);
        }
        if ctx.exit_type == ExitType::DetachKill && ctx.parent_pid > 1 {
            if let Err(e) = signal::kill(Pid::from_raw(ctx.parent_pid), Signal::SIGHUP) {
                eprintln!("failed to signal parent: {}", e);
            }
        }
    } else if ctx.flags.control_control {
        match &banner {
            Some(msg) => print!("%exit {}", msg),
            None => print!("%exit"),
        }
        // Mode terminator, then restore the saved terminal attributes.
        print!("\x1b\\");
        let _ = std::io::stdout().flush();
        drop(ctx.saved_tty.take());
    } else if let Some(msg) = &banner {
        eprintln!("{}", msg);
    }

    ctx.exit_code
}

/// Replaces the process image with `shell -c <command>`, the mechanics
/// shared by the Wait-state `Shell` reply and the Attached-state `Exec`
/// message. `argv[0]` is the shell's basename, prefixed with `-` when
/// `login` is set. Standard streams are restored to blocking mode and
/// every other descriptor above stderr is closed first.
pub fn exec_shell(shell: &str, command: &str, login: bool) -> anyhow::Result<()> {
    for fd in [crate::consts::STDIN_FD, crate::consts::STDOUT_FD, crate::consts::STDERR_FD] {
        crate::tty::set_blocking(fd).with_context(|| format!("restoring blocking mode on fd {}", fd))?;
    }
    close_fds_above_stderr();

    let basename = shell.rsplit('/').next().unwrap_or(shell);
    let argv0 = if login { format!("-{}", basename) } else { basename.to_string() };

    let shell_c = CString::new(shell).context("shell path contains a NUL")?;
    let argv0_c = CString::new(argv0).context("argv0 contains a NUL")?;
    let flag_c = CString::new("-c").unwrap();
    let command_c = CString::new(command).context("command contains a NUL")?;

    unistd::execv(&shell_c, &[argv0_c.as_c_str(), flag_c.as_c_str(), command_c.as_c_str()])
        .context("execv failed")?;
    unreachable!("execv only returns on error, which is mapped above")
}

fn close_fds_above_stderr() {
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max_fd = if max_fd > 0 { max_fd as i32 } else { 1024 };
    for fd in (crate::consts::STDERR_FD + 1)..max_fd {
        let _ = unistd::close(fd);
    }
}
