use std::collections::BTreeSet;
use std::env;
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use super::{Result, ResultExt};

fn default_max_in_flight() -> usize {
    8
}
fn default_poll_interval() -> u64 {
    1_000
}
fn default_event_buffer() -> usize {
    512
}

/// Orchestrator configuration, deserializable from armada.conf
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Global cap on concurrent instance operations per deployment
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Agent poll cadence inside watch windows (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Bounded event queue size before the overflow policy kicks in
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Base URL of the agent RPC endpoint; unset means the in-process mock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_api: Option<String>,

    /// File the event stream is written to, next to the rendered output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_sink: Option<PathBuf>,

    /// Stages rendered as plain status lines instead of a progress bar
    #[serde(default)]
    pub no_progress_stages: BTreeSet<String>,
}

impl Default for Config {
    fn default() -> Self {
        let mut no_bar = BTreeSet::new();
        no_bar.insert("Preparing deployment".to_string());
        Config {
            max_in_flight: default_max_in_flight(),
            poll_interval_ms: default_poll_interval(),
            event_buffer: default_event_buffer(),
            agent_api: None,
            event_sink: None,
            no_progress_stages: no_bar,
        }
    }
}

impl Config {
    /// Read the config from `DEPLOY_CONFIG`, `./armada.conf`, then
    /// `~/.armada.conf`; a missing file means defaults
    pub fn read() -> Result<Config> {
        if let Ok(explicit) = env::var("DEPLOY_CONFIG") {
            let pth = Path::new(&explicit).to_path_buf();
            if !pth.is_file() {
                bail!("DEPLOY_CONFIG must point at a config file");
            }
            return Config::read_from(&pth);
        }
        let local = Path::new("./armada.conf").to_path_buf();
        if local.is_file() {
            return Config::read_from(&local);
        }
        if let Some(home) = dirs::home_dir() {
            let dotfile = home.join(".armada.conf");
            if dotfile.is_file() {
                return Config::read_from(&dotfile);
            }
        }
        Ok(Config::default())
    }

    fn read_from(pth: &PathBuf) -> Result<Config> {
        debug!("reading config from {}", pth.display());
        let mut f = File::open(pth).chain_err(|| format!("cannot open {}", pth.display()))?;
        let mut text = String::new();
        f.read_to_string(&mut text)?;
        let conf: Config = serde_yaml::from_str(&text)?;
        conf.verify()?;
        Ok(conf)
    }

    pub fn verify(&self) -> Result<()> {
        if self.max_in_flight < 1 {
            bail!("max_in_flight must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be positive");
        }
        if self.event_buffer < 16 {
            bail!("event_buffer below 16 would drop progress constantly");
        }
        Ok(())
    }
}
