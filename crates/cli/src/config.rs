//! Optional config file at `$HOME/.kubetail/config.yaml`. Unrecognized keys
//! are an error: a typo'd default should fail loudly, not silently no-op.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct GeneralConfig {
    pub kubeconfig: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct CommandsConfig {
    #[serde(default)]
    pub logs: LogsDefaults,
    #[serde(default)]
    pub serve: ServeDefaults,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct LogsDefaults {
    pub head: Option<u64>,
    pub tail: Option<u64>,
    pub kube_context: Option<String>,
    pub columns: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ServeDefaults {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub skip_open: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DashboardConfig {
    pub session_secret: Option<String>,
    pub session_cookie_name: Option<String>,
    pub csrf_protect: Option<bool>,
    pub csrf_secret: Option<String>,
}

/// The per-user kubetail directory (state, config).
pub fn kubetail_dir() -> Option<PathBuf> {
    dirs_next::home_dir().map(|h| h.join(".kubetail"))
}

pub fn load() -> Result<FileConfig> {
    match kubetail_dir() {
        Some(dir) => load_from(&dir.join("config.yaml")),
        None => Ok(FileConfig::default()),
    }
}

pub fn load_from(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let cfg: FileConfig = serde_yaml::from_str(
            r#"
general:
  kubeconfig: /home/me/.kube/other
commands:
  logs:
    head: 25
    tail: 50
    kube-context: staging
    columns: [timestamp, dot, pod, message]
  serve:
    host: 0.0.0.0
    port: 7500
    skip-open: true
dashboard:
  session-secret: s3cret
  csrf-protect: true
"#,
        )
        .unwrap();
        assert_eq!(cfg.commands.logs.tail, Some(50));
        assert_eq!(cfg.commands.logs.kube_context.as_deref(), Some("staging"));
        assert_eq!(cfg.commands.serve.port, Some(7500));
        assert_eq!(cfg.dashboard.csrf_protect, Some(true));
    }

    #[test]
    fn unknown_keys_are_an_error() {
        let err = serde_yaml::from_str::<FileConfig>("commands:\n  logs:\n    heda: 10\n");
        assert!(err.is_err());
        let err = serde_yaml::from_str::<FileConfig>("genral: {}\n");
        assert!(err.is_err());
    }

    #[test]
    fn missing_file_is_defaults() {
        let cfg = load_from(Path::new("/nonexistent/kubetail/config.yaml")).unwrap();
        assert!(cfg.general.kubeconfig.is_none());
        assert!(cfg.commands.logs.head.is_none());
    }
}
