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

//! A trimmed, `toml`-backed config, read the way the teacher's
//! `config::read_config` reads `~/.config/shpool/config.toml`. The client
//! half only has two settings worth exposing: which environment variables
//! to forward into the identify burst, and how long `SocketBringup` will
//! wait for a freshly spawned server before giving up.

use std::{fs, path::PathBuf, time::Duration};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::user;

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else {
        let user_info = user::info()?;
        let mut config_path = PathBuf::from(user_info.home_dir);
        config_path.push(".config");
        config_path.push("shellmux");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(&config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// Extra environment variable names (beyond the full `environ` the
    /// identify burst always sends) that the server should treat as
    /// significant even if only partially forwarded by an intermediate
    /// shell. Currently informational only; kept so the config schema
    /// matches what `IdentifyEnviron` actually needs if forwarding is
    /// ever narrowed.
    pub forward_env: Option<Vec<String>>,

    /// How long, in seconds, `SocketBringup` should poll a freshly spawned
    /// server before giving up. Defaults to 10 in `ProcessServerStart`
    /// when unset.
    pub connect_timeout_secs: Option<u64>,
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(10))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_connect_timeout_is_ten_seconds() {
        let config = Config::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn parses_explicit_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "connect_timeout_secs = 30\nforward_env = [\"SSH_AUTH_SOCK\"]\n").unwrap();
        let config = read_config(&Some(path.to_string_lossy().into_owned())).unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.forward_env.as_deref(), Some(&["SSH_AUTH_SOCK".to_string()][..]));
    }
}
