use std::{env, fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// shell overrides $SHELL and the user's passwd entry when
    /// launching new sessions.
    pub shell: Option<String>,
    /// Make Ctrl-X pass through to the shell instead of detaching.
    /// `--no-ctrl-x` sets this for a single attachment.
    pub disable_ctrl_x: Option<bool>,
}

impl Config {
    /// Load the config. An explicitly given path must parse; the
    /// default path ($XDG_CONFIG_HOME/sess/config.toml or
    /// ~/.config/sess/config.toml) is allowed to be absent.
    pub fn load(config_file: Option<&str>) -> anyhow::Result<Config> {
        let (path, required) = match config_file {
            Some(f) => (PathBuf::from(f), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Config::default()),
            },
        };

        if !required && !path.exists() {
            return Ok(Config::default());
        }

        let config_str = fs::read_to_string(&path)
            .with_context(|| format!("reading config toml from {path:?}"))?;
        let config = toml::from_str(&config_str).context("parsing config file")?;
        Ok(config)
    }
}

fn default_config_path() -> Option<PathBuf> {
    if let Ok(dir) = env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(dir).join("sess").join("config.toml"));
    }
    env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".config").join("sess").join("config.toml"))
}
