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

//! The process-wide client state described in spec section 3. A single
//! `ClientContext` is constructed at startup and threaded by `&mut` into
//! every component; nothing here is global except the signal dispatcher's
//! flag word, which has its own thin indirection in `signals.rs`.

use crate::transport::Transport;

/// Boolean modes carried in the `IdentifyFlags` frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientFlags {
    /// Shell exec in the Terminator should prefix argv0 with `-`.
    pub login: bool,
    /// Machine-readable terminal control mode: `%exit`-prefixed banners,
    /// `ESC \` termination.
    pub control_control: bool,
}

impl ClientFlags {
    pub fn as_word(&self) -> u32 {
        let mut word = 0;
        if self.login {
            word |= shellmux_protocol::IDENTIFY_FLAGS_LOGIN;
        }
        if self.control_control {
            word |= shellmux_protocol::IDENTIFY_FLAGS_CONTROL_CONTROL;
        }
        word
    }
}

/// The two observable states plus the terminal Exiting transition (spec
/// section 4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Wait,
    Attached,
    Exiting,
}

/// Why the client is tearing down. Carries the session name directly on
/// the variants that need it rather than as a separate optional field, so
/// "detached but session name present" can't be represented when the
/// reason isn't a detach variant at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    None,
    Detached(Option<String>),
    DetachedHup(Option<String>),
    LostTty,
    Terminated,
    LostServer,
    Exited,
    ServerExited,
}

impl Default for ExitReason {
    fn default() -> Self {
        ExitReason::None
    }
}

impl ExitReason {
    /// The `[...]` banner body from spec section 4.7's table, or `None` if
    /// there is nothing to print.
    pub fn banner(&self) -> Option<String> {
        match self {
            ExitReason::None => None,
            ExitReason::Detached(Some(name)) => Some(format!("detached (from session {})", name)),
            ExitReason::Detached(None) => Some("detached".to_string()),
            ExitReason::DetachedHup(Some(name)) => {
                Some(format!("detached and SIGHUP (from session {})", name))
            }
            ExitReason::DetachedHup(None) => Some("detached and SIGHUP".to_string()),
            ExitReason::LostTty => Some("lost tty".to_string()),
            ExitReason::Terminated => Some("terminated".to_string()),
            ExitReason::LostServer => Some("lost server".to_string()),
            ExitReason::Exited => Some("exited".to_string()),
            ExitReason::ServerExited => Some("server exited".to_string()),
        }
    }
}

/// The last terminal message kind from the server, used by the Terminator
/// to select its post-loop action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitType {
    #[default]
    None,
    Detach,
    DetachKill,
    Exec,
}

/// The process-wide client state. Owned by the event loop driver (`run`)
/// and passed by `&mut` to every component function.
pub struct ClientContext {
    pub flags: ClientFlags,
    pub transport: Transport,
    pub state: ClientState,
    /// Set once, the moment `state` first becomes `Attached`. The
    /// Terminator needs this even after `state` has moved on to
    /// `Exiting`, to decide between the "was attached" and "still in
    /// Wait" banner paths in spec section 4.7.
    pub was_attached: bool,
    pub exit_reason: ExitReason,
    pub exit_code: i32,
    pub exit_type: ExitType,
    pub shell_command: Option<String>,
    pub exec_shell: Option<String>,
    pub exec_command: Option<String>,
    pub saved_tty: Option<crate::tty::AttachFlagsGuard>,
    pub parent_pid: i32,
}

impl ClientContext {
    pub fn new(transport: Transport, flags: ClientFlags, shell_command: Option<String>) -> Self {
        ClientContext {
            flags,
            transport,
            state: ClientState::Wait,
            was_attached: false,
            exit_reason: ExitReason::None,
            exit_code: 0,
            exit_type: ExitType::None,
            shell_command,
            exec_shell: None,
            exec_command: None,
            saved_tty: None,
            parent_pid: nix::unistd::getppid().as_raw(),
        }
    }

    /// The only place `state` may be set to `Exiting`. Centralizing this
    /// keeps the "exit_reason != None implies state == Exiting" invariant
    /// true by construction: nothing else in the crate writes `state`
    /// directly to `Exiting`.
    pub fn transition_to_exiting(&mut self, reason: ExitReason) {
        self.exit_reason = reason;
        self.state = ClientState::Exiting;
        crate::test_hooks::emit("exiting");
    }

    /// The only place `state` may become `Attached`.
    pub fn transition_to_attached(&mut self) {
        self.state = ClientState::Attached;
        self.was_attached = true;
    }
}
