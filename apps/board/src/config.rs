use std::{collections::HashMap, fs, io::ErrorKind, path::Path};

use anyhow::{anyhow, Context};
use board_core::{push_url_from_api_url, BoardError, ReconcilePolicy};

pub const DEFAULT_CONFIG_PATH: &str = "board.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_url: String,
    pub push_url: Option<String>,
    pub api_key: Option<String>,
    pub board_id: Option<String>,
    pub log_filter: String,
    pub reconcile_policy: ReconcilePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:54321/rest/v1".into(),
            push_url: None,
            api_key: None,
            board_id: None,
            log_filter: "info".into(),
            reconcile_policy: ReconcilePolicy::default(),
        }
    }
}

impl Settings {
    /// Explicit push url, or the api url with its scheme switched to websocket.
    pub fn push_url(&self) -> Result<String, BoardError> {
        match &self.push_url {
            Some(push_url) => Ok(push_url.clone()),
            None => push_url_from_api_url(&self.api_url),
        }
    }
}

pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new(DEFAULT_CONFIG_PATH), |key| std::env::var(key).ok())
}

/// Defaults, then the flat `key = "value"` table at `path` if it exists, then
/// environment overrides.
pub fn load_settings_from<F>(path: &Path, env: F) -> anyhow::Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => {
            let file_cfg = toml::from_str::<HashMap<String, String>>(&raw)
                .with_context(|| format!("invalid config file '{}'", path.display()))?;
            if let Some(v) = file_cfg.get("api_url") {
                settings.api_url = v.clone();
            }
            if let Some(v) = file_cfg.get("push_url") {
                settings.push_url = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("api_key") {
                settings.api_key = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("board_id") {
                settings.board_id = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("log_filter") {
                settings.log_filter = v.clone();
            }
            if let Some(v) = file_cfg.get("reconcile_policy") {
                settings.reconcile_policy = parse_policy(v)?;
            }
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    }

    if let Some(v) = env("BOARD_API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = env("APP__API_URL") {
        settings.api_url = v;
    }

    if let Some(v) = env("BOARD_PUSH_URL") {
        settings.push_url = Some(v);
    }
    if let Some(v) = env("BOARD_API_KEY") {
        settings.api_key = Some(v);
    }
    if let Some(v) = env("BOARD_ID") {
        settings.board_id = Some(v);
    }
    if let Some(v) = env("BOARD_LOG") {
        settings.log_filter = v;
    }
    if let Some(v) = env("BOARD_RECONCILE") {
        settings.reconcile_policy = parse_policy(&v)?;
    }

    Ok(settings)
}

fn parse_policy(raw: &str) -> anyhow::Result<ReconcilePolicy> {
    raw.parse::<ReconcilePolicy>().map_err(|err| anyhow!(err))
}
