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

pub const BUF_SIZE: usize = 1024 * 16;

/// Maximum payload shellmux will pack into a single frame. `IdentifyEnviron`
/// entries that would exceed this (minus the frame header) are silently
/// skipped per spec.
pub const MAX_FRAME_PAYLOAD: usize = BUF_SIZE;

pub const STDIN_FD: i32 = 0;
pub const STDOUT_FD: i32 = 1;
pub const STDERR_FD: i32 = 2;

/// A magic env var which tells a freshly spawned `shellmux daemon` that it
/// was launched by a client's start-race and should release the lock file
/// handed to it once it is listening.
pub const AUTODAEMONIZE_VAR: &str = "SHELLMUX__INTERNAL__AUTODAEMONIZE";
