use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Whether the bridge hosts one implicit context or a registry of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    /// Exactly one context, created at startup, no handles.
    Single,
    /// Contexts are created and destroyed through handles.
    #[default]
    Multi,
}

/// Options applied to every newly created evaluation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Limit engine capabilities (no filesystem access).
    pub restricted: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { restricted: true }
    }
}

/// Contents of the settings file. Every field is optional; unset fields fall
/// back to command line / built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ContextMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restricted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_jobs_max: Option<usize>,
}

impl Settings {
    fn normalize(&mut self) {
        if self.queue_capacity == Some(0) {
            self.queue_capacity = None;
        }
        if self.recent_jobs_max == Some(0) {
            self.recent_jobs_max = None;
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("evalq").join("config.json"))
}

/// Load settings from the default location. A missing file is `Ok(None)`.
pub fn load_settings() -> anyhow::Result<Option<Settings>> {
    load_settings_from(&settings_path()?)
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<Option<Settings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let mut settings: Settings = serde_json::from_str(&raw)?;
    settings.normalize();
    Ok(Some(settings))
}

pub fn save_settings(settings: &Settings) -> anyhow::Result<PathBuf> {
    let path = settings_path()?;
    save_settings_to(&path, settings)?;
    Ok(path)
}

pub fn save_settings_to(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid settings path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut settings = settings.clone();
    settings.normalize();

    let json = serde_json::to_string_pretty(&settings)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
