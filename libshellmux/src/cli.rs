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

//! Command-line parsing, mirroring the teacher's `Args`/`Commands` derive
//! in `lib.rs`. Spec section 6 treats "command-line parsing of the
//! multiplexer command" as an out-of-scope collaborator behind a
//! `CommandParser` trait; this module is both the trait and the
//! production `clap` implementation of it, since the client still needs
//! some way to parse its own argv to run as a standalone binary.

use clap::{Parser, Subcommand};

/// Mirrors `libshpool::Args`: global flags plus a subcommand. Only
/// `Attach` drives the state machine described in spec section 4; the
/// others are thin stubs a real multiplexer client would also expose.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(short, long, action, help = "The file to write logs to")]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times"
    )]
    pub verbose: u8,

    #[clap(short, long, action, help = "The path of the unix socket to dial")]
    pub socket: Option<String>,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Attach to a session, starting the daemon if necessary")]
    Attach {
        #[clap(long, help = "Prefix the exec'd shell's argv0 with '-', as a login shell")]
        login: bool,

        #[clap(long, help = "Speak the machine-readable CONTROLCONTROL framing on stdout")]
        control_control: bool,

        #[clap(long, help = "Fail instead of starting the daemon if it isn't already running")]
        no_daemonize: bool,

        #[clap(
            trailing_var_arg = true,
            help = "Command to run instead of the user's default shell"
        )]
        command: Vec<String>,
    },
}

impl Args {
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// What the client ends up sending as the first non-identify frame (spec
/// section 6): either a packed command list, or nothing, meaning "give me
/// a shell for `-c`".
#[derive(Debug, Clone, Default)]
pub struct ParsedCommand {
    pub argv: Vec<String>,
    pub start_server: bool,
    pub login: bool,
    pub control_control: bool,
}

impl ParsedCommand {
    /// The argv joined back into a single `-c` string, for the Wait-state
    /// `Shell` reply path, which execs through a shell rather than an
    /// exact argv vector.
    pub fn shell_command(&self) -> Option<String> {
        if self.argv.is_empty() {
            None
        } else {
            Some(self.argv.join(" "))
        }
    }
}

/// Packs `argv` as spec section 6 describes the `Command` payload:
/// `{argc, packed_argv}` where `packed_argv` is NUL-terminated strings
/// back to back. Fails with "command too long" on overrun, matching the
/// spec's stated failure mode.
pub fn encode_command_payload(argv: &[String]) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(argv.len() as u32).to_le_bytes());
    for arg in argv {
        buf.extend_from_slice(arg.as_bytes());
        buf.push(0);
    }
    if buf.len() > crate::consts::MAX_FRAME_PAYLOAD {
        return Err(anyhow::anyhow!("command too long"));
    }
    Ok(buf)
}

pub trait CommandParser {
    fn parse(&self, argv: &[String]) -> Result<ParsedCommand, String>;
}

/// Thin wrapper around the `clap` derive above, satisfying the
/// `CommandParser` collaborator contract from spec section 6.
pub struct ClapCommandParser;

impl CommandParser for ClapCommandParser {
    fn parse(&self, argv: &[String]) -> Result<ParsedCommand, String> {
        let args = Args::try_parse_from(argv).map_err(|e| e.to_string())?;
        match args.command {
            Commands::Attach { login, control_control, no_daemonize, command } => Ok(ParsedCommand {
                argv: command,
                start_server: !no_daemonize,
                login,
                control_control,
            }),
            Commands::Version => Err("wrapper binary must handle version".to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attach_with_no_command_means_shell() {
        let argv: Vec<String> = vec!["shellmux".into(), "attach".into()];
        let parsed = ClapCommandParser.parse(&argv).expect("parse");
        assert!(parsed.argv.is_empty());
        assert_eq!(parsed.shell_command(), None);
    }

    #[test]
    fn attach_with_trailing_command() {
        let argv: Vec<String> =
            vec!["shellmux".into(), "attach".into(), "vim".into(), "notes.txt".into()];
        let parsed = ClapCommandParser.parse(&argv).expect("parse");
        assert_eq!(parsed.shell_command().as_deref(), Some("vim notes.txt"));
    }

    #[test]
    fn login_and_control_control_flags() {
        let argv: Vec<String> =
            vec!["shellmux".into(), "attach".into(), "--login".into(), "--control-control".into()];
        let parsed = ClapCommandParser.parse(&argv).expect("parse");
        assert!(parsed.login);
        assert!(parsed.control_control);
    }
}
