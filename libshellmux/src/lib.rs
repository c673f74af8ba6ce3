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

//! `libshellmux` drives one invocation of `shellmux attach`: it resolves
//! the daemon's socket, performs the identify burst, then runs the
//! cooperative event loop described in spec section 5 until the state
//! machine reaches `Exiting`, and hands off to the Terminator.

use std::{env, fs, io, os::fd::BorrowedFd, path::PathBuf, sync::Mutex};

use anyhow::{anyhow, Context};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use shellmux_protocol::MsgType;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod cli;
pub mod config;
pub mod consts;
pub mod context;
pub mod identify;
pub mod server_start;
pub mod signals;
pub mod socket_bringup;
pub mod state_machine;
pub mod stdin_pump;
pub mod terminator;
mod test_hooks;
pub mod transport;
pub mod tty;
mod user;

pub use cli::{Args, Commands};

use context::{ClientContext, ClientFlags, ClientState, ExitReason};
use server_start::ProcessServerStart;

/// Runs the tool end to end and returns the process exit code, mirroring
/// the teacher's `run()` except that it hands a code back instead of
/// calling `std::process::exit` itself, so `shellmux/src/main.rs` decides
/// when to actually terminate.
pub fn run(args: Args) -> anyhow::Result<i32> {
    let (login, control_control, no_daemonize, command) = match args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Attach { login, control_control, no_daemonize, command } => {
            (login, control_control, no_daemonize, command)
        }
    };

    init_logging(args.verbose, &args.log_file);

    #[cfg(feature = "test_hooks")]
    if let Ok(test_hook_sock) = env::var("SHELLMUX_TEST_HOOK_SOCKET_PATH") {
        tracing::info!("spawning test hook sock at {}", test_hook_sock);
        test_hooks::TEST_HOOK_SERVER.set_socket_path(test_hook_sock);
        std::thread::spawn(|| {
            test_hooks::TEST_HOOK_SERVER.start();
        });
        tracing::info!("waiting for test hook connection");
        test_hooks::TEST_HOOK_SERVER.wait_for_connect()?;
    }
    test_hooks::emit("client-startup");

    // Installed before SocketBringup, per spec section 4.5: a daemonizing
    // server spawn can leave its launcher as a zombie the moment it exits,
    // and nothing reaps it until CHLD is handled.
    let bridge = signals::SignalBridge::install().context("installing signal handlers")?;

    let config = config::read_config(&args.config_file)?;
    let socket_path = resolve_socket_path(args.socket.clone());

    let starter = ProcessServerStart {
        server_bin: sibling_server_binary(),
        connect_timeout: config.connect_timeout(),
    };
    let transport = socket_bringup::bring_up(&socket_path, !no_daemonize, &starter)
        .context("bringing up connection to daemon")?;

    let flags = ClientFlags { login, control_control };
    let shell_command = if command.is_empty() { None } else { Some(command.join(" ")) };
    let mut ctx = ClientContext::new(transport, flags, shell_command);

    if control_control {
        ctx.saved_tty = Some(tty::set_attach_flags().context("entering CONTROLCONTROL tty mode")?);
    }

    identify::run(&mut ctx).context("running identify burst")?;
    test_hooks::emit("identify-done");

    if command.is_empty() {
        ctx.transport.send(MsgType::Shell, &[]).context("sending Shell request")?;
    } else {
        let payload = cli::encode_command_payload(&command)?;
        ctx.transport.send(MsgType::Command, &payload).context("sending Command")?;
    }

    let mut pump = stdin_pump::StdinPump::new().context("starting stdin pump")?;

    run_event_loop(&mut ctx, &mut pump, &bridge)?;

    Ok(terminator::run(ctx))
}

fn run_event_loop(
    ctx: &mut ClientContext,
    pump: &mut stdin_pump::StdinPump,
    bridge: &signals::SignalBridge,
) -> anyhow::Result<()> {
    while ctx.state != ClientState::Exiting {
        let transport_fd = unsafe { BorrowedFd::borrow_raw(ctx.transport.raw_fd()) };
        let stdin_fd = unsafe { BorrowedFd::borrow_raw(pump.fd()) };
        let signal_fd = unsafe { BorrowedFd::borrow_raw(bridge.poll_fd()) };

        let mut fds = vec![
            PollFd::new(transport_fd, PollFlags::POLLIN),
            PollFd::new(signal_fd, PollFlags::POLLIN),
        ];
        let stdin_idx = if pump.enabled() {
            fds.push(PollFd::new(stdin_fd, PollFlags::POLLIN));
            Some(fds.len() - 1)
        } else {
            None
        };

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(anyhow!("poll failed: {}", e)),
        }

        if fds[0].revents().map(|r| !r.is_empty()).unwrap_or(false) {
            match ctx.transport.recv().context("reading from transport")? {
                Some(frame) => state_machine::dispatch(ctx, pump, frame).context("dispatching message")?,
                None => {
                    ctx.transition_to_exiting(ExitReason::LostServer);
                    ctx.exit_code = 1;
                }
            }
        }

        if ctx.state == ClientState::Exiting {
            break;
        }

        if fds[1].revents().map(|r| !r.is_empty()).unwrap_or(false) {
            bridge.dispatch(ctx).context("dispatching signal")?;
        }

        if ctx.state == ClientState::Exiting {
            break;
        }

        if let Some(idx) = stdin_idx {
            if fds[idx].revents().map(|r| !r.is_empty()).unwrap_or(false) {
                pump.on_readable(ctx).context("reading stdin")?;
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: u8, log_file: &Option<String>) {
    let trace_level = if verbose == 0 {
        tracing::Level::INFO
    } else if verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };

    if let Some(log_file) = log_file.clone() {
        if let Ok(file) = fs::File::create(log_file) {
            let _ = tracing_subscriber::fmt()
                .with_max_level(trace_level)
                .with_thread_ids(true)
                .with_target(false)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_writer(Mutex::new(file))
                .try_init();
            return;
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_max_level(trace_level)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(io::stderr)
        .try_init();
}

/// Resolves the daemon socket path the way the teacher does: under
/// `$XDG_RUNTIME_DIR/shellmux` (falling back to `~/.shellmux`) unless the
/// caller passes an explicit path, which is used as-is.
fn resolve_socket_path(explicit: Option<String>) -> PathBuf {
    match explicit {
        Some(s) => PathBuf::from(s),
        None => {
            let runtime_dir = match env::var("XDG_RUNTIME_DIR") {
                Ok(dir) => PathBuf::from(dir),
                Err(_) => {
                    PathBuf::from(env::var("HOME").unwrap_or_else(|_| "/tmp".to_string())).join(".shellmux")
                }
            }
            .join("shellmux");
            runtime_dir.join("shellmux.socket")
        }
    }
}

fn sibling_server_binary() -> PathBuf {
    let mut path = env::current_exe().unwrap_or_else(|_| PathBuf::from("shellmux"));
    path.set_file_name("shellmux-server");
    path
}
