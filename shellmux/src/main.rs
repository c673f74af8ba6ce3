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
/// shellmux is the client half of a terminal multiplexer: it dials a
/// daemon over a unix socket, hands over the user's terminal, and pumps
/// input/output for an attached session. See the README for more info.
use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args = libshellmux::Args::parse();

    if args.version() {
        println!("shellmux {}", VERSION);
        return Ok(());
    }

    let code = libshellmux::run(args)?;
    std::process::exit(code);
}
