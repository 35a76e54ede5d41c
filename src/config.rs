//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use anyhow::{Result, Context};
use std::{
    env,
    fs,
    path::PathBuf,
};
use serde::{Serialize, Deserialize};

// The config file lives at $CEDANA_CONFIG_DIR/config.json, falling back to
// ~/.cedana/config.json. A missing file yields the defaults: local dumps
// work, managed features (storage, GPU binary pulls) stay disabled.

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub shared_storage: SharedStorage,
    pub connection: Connection,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct SharedStorage {
    pub dump_storage_dir: String,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct Connection {
    pub cedana_url: String,
    pub cedana_auth_token: String,
}

fn config_path() -> PathBuf {
    let dir = env::var_os("CEDANA_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env::var_os("HOME").unwrap_or_else(|| "/root".into());
            PathBuf::from(home).join(".cedana")
        });
    dir.join("config.json")
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_full_config() -> Result<()> {
        let config: Config = serde_json::from_str(r#"{
            "shared_storage": { "dump_storage_dir": "/var/cedana/dumps" },
            "connection": {
                "cedana_url": "api.cedana.io",
                "cedana_auth_token": "tok"
            }
        }"#)?;

        assert_eq!(config.shared_storage.dump_storage_dir, "/var/cedana/dumps");
        assert_eq!(config.connection.cedana_url, "api.cedana.io");
        Ok(())
    }

    #[test]
    fn missing_sections_default() -> Result<()> {
        let config: Config = serde_json::from_str("{}")?;
        assert!(config.connection.cedana_auth_token.is_empty());
        Ok(())
    }
}
