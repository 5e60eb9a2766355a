use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

use crate::controller_support::{
    DEFAULT_CONSOLE_MAX_LINES, DEFAULT_GRACE_PERIOD_MS, DEFAULT_PROBE_TIMEOUT_MS,
    clamp_console_lines, clamp_grace_ms, clamp_probe_timeout_ms, env_u64, env_usize,
};

pub const CONFIG_ENV: &str = "AUTOBOT_CONFIG";

/// Everything the controller needs to find and launch the automation script.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Root for relative script candidates.
    pub base_dir: PathBuf,
    /// Probed in order; the first existing file wins.
    pub script_candidates: Vec<PathBuf>,
    /// Passed to the child after the script path.
    pub script_args: Vec<String>,
    /// Extra environment for the child.
    pub env: BTreeMap<String, String>,
    /// Probed in order with `version_arg`; the first that exits 0 wins.
    pub interpreter_candidates: Vec<String>,
    pub default_interpreter: String,
    pub version_arg: String,
    /// File stem of the log the script writes under `<script dir>/../logs/`.
    pub log_name: String,
    pub grace_period_ms: u64,
    pub probe_timeout_ms: u64,
    pub console_max_lines: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            script_candidates: vec![
                PathBuf::from("Python/main.py"),
                PathBuf::from("../Python/main.py"),
                PathBuf::from("../../Python/main.py"),
                PathBuf::from("../../../Python/main.py"),
            ],
            script_args: Vec::new(),
            env: BTreeMap::from([
                // Line-buffered, UTF-8 output so the console updates live.
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
                ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
            ]),
            interpreter_candidates: vec![
                "python".to_string(),
                "python3".to_string(),
                "py".to_string(),
            ],
            default_interpreter: "python".to_string(),
            version_arg: "--version".to_string(),
            log_name: "bot".to_string(),
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            console_max_lines: DEFAULT_CONSOLE_MAX_LINES,
        }
    }
}

fn default_base_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl ControllerConfig {
    /// Reads `$AUTOBOT_CONFIG` (TOML) when set, then applies env overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        cfg.apply_env();
        Ok(cfg.normalized())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(raw)?;
        Ok(cfg.normalized())
    }

    fn apply_env(&mut self) {
        if let Some(dir) = std::env::var_os("AUTOBOT_BASE_DIR") {
            self.base_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_u64("AUTOBOT_GRACE_MS") {
            self.grace_period_ms = v;
        }
        if let Some(v) = env_u64("AUTOBOT_PROBE_TIMEOUT_MS") {
            self.probe_timeout_ms = v;
        }
        if let Some(v) = env_usize("AUTOBOT_CONSOLE_MAX_LINES") {
            self.console_max_lines = v;
        }
    }

    fn normalized(mut self) -> Self {
        self.grace_period_ms = clamp_grace_ms(self.grace_period_ms);
        self.probe_timeout_ms = clamp_probe_timeout_ms(self.probe_timeout_ms);
        self.console_max_lines = clamp_console_lines(self.console_max_lines);
        if self.default_interpreter.trim().is_empty() {
            self.default_interpreter = "python".to_string();
        }
        self
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Candidates resolved against `base_dir`; absolute entries are kept as-is.
    pub fn script_candidate_paths(&self) -> Vec<PathBuf> {
        self.script_candidates
            .iter()
            .map(|c| {
                if c.is_absolute() {
                    c.clone()
                } else {
                    self.base_dir.join(c)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_python_layout() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.interpreter_candidates, ["python", "python3", "py"]);
        assert_eq!(cfg.default_interpreter, "python");
        assert_eq!(cfg.log_name, "bot");
        assert_eq!(cfg.grace_period(), Duration::from_secs(3));
        assert_eq!(cfg.probe_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn toml_overrides_and_clamps() {
        let cfg = ControllerConfig::from_toml(
            r#"
            base_dir = "/opt/bot"
            script_candidates = ["scripts/run.py", "/abs/main.py"]
            grace_period_ms = 1
            log_name = "worker"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.grace_period_ms, 100);
        assert_eq!(cfg.log_name, "worker");
        assert_eq!(cfg.interpreter_candidates.len(), 3);
        assert_eq!(
            cfg.script_candidate_paths(),
            vec![
                PathBuf::from("/opt/bot/scripts/run.py"),
                PathBuf::from("/abs/main.py")
            ]
        );
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = ControllerConfig::from_toml("grace_period_ms = \"soon\"").unwrap_err();
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn from_file_reports_path_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = ControllerConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }
}
