//! Runtime settings.
//!
//! Settings come from a TOML file (by default
//! `<config_dir>/ridian/config.toml`), then environment overrides. Every field
//! is optional; empty strings mean "use the default".
//!
//! ```toml
//! executable_path = "/opt/R/4.4/bin/R"
//! aux_executable_path = "/usr/bin/pandoc"
//! eval_timeout_secs = 600
//!
//! [env]
//! R_LIBS_USER = "/home/me/R/library"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

/// Environment variable overriding `executable_path`.
pub const ENV_EXECUTABLE: &str = "RIDIAN_R_PATH";
/// Environment variable overriding `aux_executable_path`.
pub const ENV_AUX_EXECUTABLE: &str = "RIDIAN_PANDOC_PATH";

/// Variable the interpreter reads to locate the rendering helper.
const PANDOC_ENV: &str = "RSTUDIO_PANDOC";

const DEFAULT_PREVIEW_CHARS: usize = 200;

#[cfg(windows)]
const DEFAULT_EXECUTABLE: &str = "R.exe";
#[cfg(not(windows))]
const DEFAULT_EXECUTABLE: &str = "/usr/local/bin/R";

fn default_interpreter_args() -> Vec<String> {
    vec!["--vanilla".into(), "--quiet".into(), "--slave".into()]
}

fn default_language_server_args() -> Vec<String> {
    vec!["--slave".into(), "-e".into(), "languageserver::run()".into()]
}

fn default_preview_chars() -> usize {
    DEFAULT_PREVIEW_CHARS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Interpreter executable. Empty selects the platform default.
    pub executable_path: String,
    /// Rendering helper handed to the interpreter via `RSTUDIO_PANDOC`.
    pub aux_executable_path: String,
    #[serde(default = "default_interpreter_args")]
    pub interpreter_args: Vec<String>,
    #[serde(default = "default_language_server_args")]
    pub language_server_args: Vec<String>,
    /// Directory prepended to the child's `PATH`.
    pub path_prefix: Option<PathBuf>,
    /// Extra environment for child processes.
    pub env: HashMap<String, String>,
    pub artifact_root: Option<PathBuf>,
    pub eval_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            executable_path: String::new(),
            aux_executable_path: String::new(),
            interpreter_args: default_interpreter_args(),
            language_server_args: default_language_server_args(),
            path_prefix: None,
            env: HashMap::new(),
            artifact_root: None,
            eval_timeout_secs: None,
            request_timeout_secs: None,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }
}

/// Default location of the settings file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ridian").join("config.toml"))
}

impl Settings {
    /// Load settings from `path`, or the default location when `None`.
    ///
    /// A missing file yields defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);

        let mut settings = match path {
            Some(ref p) if p.exists() => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read settings from {}", p.display()))?;
                Self::from_toml(&text)
                    .with_context(|| format!("Failed to parse settings in {}", p.display()))?
            }
            _ => {
                debug!("No settings file found, using defaults");
                Settings::default()
            }
        };

        settings.apply_env_overrides();
        Ok(settings)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid settings TOML")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(ENV_EXECUTABLE) {
            self.executable_path = path;
        }
        if let Ok(path) = std::env::var(ENV_AUX_EXECUTABLE) {
            self.aux_executable_path = path;
        }
    }

    /// Executable to spawn, substituting the platform default for an empty setting.
    pub fn executable(&self) -> PathBuf {
        let configured = self.executable_path.trim();
        if configured.is_empty() {
            PathBuf::from(DEFAULT_EXECUTABLE)
        } else {
            PathBuf::from(configured)
        }
    }

    /// Where stored artifacts go.
    pub fn artifact_root(&self) -> PathBuf {
        self.artifact_root.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("ridian")
                .join("artifacts")
        })
    }

    pub fn eval_timeout(&self) -> Option<Duration> {
        self.eval_timeout_secs.map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// Apply environment overrides to a child command.
    pub fn configure_command(&self, command: &mut Command) {
        let aux = self.aux_executable_path.trim();
        if !aux.is_empty() {
            command.env(PANDOC_ENV, aux);
        }

        if let Some(prefix) = &self.path_prefix {
            let mut paths = vec![prefix.clone()];
            if let Some(existing) = std::env::var_os("PATH") {
                paths.extend(std::env::split_paths(&existing));
            }
            if let Ok(joined) = std::env::join_paths(paths) {
                command.env("PATH", joined);
            }
        }

        command.envs(&self.env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.interpreter_args, ["--vanilla", "--quiet", "--slave"]);
        assert_eq!(
            settings.language_server_args,
            ["--slave", "-e", "languageserver::run()"]
        );
        assert_eq!(settings.eval_timeout(), None);
        assert_eq!(settings.preview_chars, 200);
    }

    #[test]
    fn test_empty_executable_uses_platform_default() {
        let mut settings = Settings::default();
        assert_eq!(settings.executable(), PathBuf::from(DEFAULT_EXECUTABLE));

        settings.executable_path = "   ".to_string();
        assert_eq!(settings.executable(), PathBuf::from(DEFAULT_EXECUTABLE));

        settings.executable_path = "/opt/R/bin/R".to_string();
        assert_eq!(settings.executable(), PathBuf::from("/opt/R/bin/R"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml(
            r#"
            executable_path = "/opt/R/bin/R"
            eval_timeout_secs = 30

            [env]
            LANG = "C.UTF-8"
            "#,
        )
        .unwrap();

        assert_eq!(settings.executable_path, "/opt/R/bin/R");
        assert_eq!(settings.eval_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(settings.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert_eq!(settings.interpreter_args, default_interpreter_args());
        assert_eq!(settings.preview_chars, DEFAULT_PREVIEW_CHARS);
    }

    #[test]
    fn test_malformed_toml_is_error() {
        assert!(Settings::from_toml("executable_path = [").is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(settings.interpreter_args, default_interpreter_args());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "preview_chars = 80\n").unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.preview_chars, 80);
    }
}
