use std::path::PathBuf;

use crate::{
    config::ControllerConfig,
    discovery::{self, Interpreter},
};

/// Snapshot of what discovery found, for a "check environment" action.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnvironmentReport {
    pub base_dir: PathBuf,
    /// First existing candidate, if any.
    pub script: Option<PathBuf>,
    pub candidates_checked: Vec<PathBuf>,
    pub interpreter: String,
    /// `None` when no candidate answered and the default is unverified.
    pub interpreter_version: Option<String>,
    pub log_path: PathBuf,
    pub log_exists: bool,
}

impl EnvironmentReport {
    pub fn is_ready(&self) -> bool {
        self.script.is_some() && self.interpreter_version.is_some()
    }

    /// Human-readable lines, one finding per line.
    pub fn lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        out.push(format!("base dir: {}", self.base_dir.display()));
        match &self.script {
            Some(p) => out.push(format!("script: {}", p.display())),
            None => {
                out.push("script: not found".to_string());
                for c in &self.candidates_checked {
                    out.push(format!("  checked: {}", c.display()));
                }
            }
        }
        match &self.interpreter_version {
            Some(v) => out.push(format!("interpreter: {} ({v})", self.interpreter)),
            None => out.push(format!(
                "interpreter: {} (unverified; no candidate answered the version probe)",
                self.interpreter
            )),
        }
        out.push(format!(
            "log file: {} ({})",
            self.log_path.display(),
            if self.log_exists { "present" } else { "missing" }
        ));
        out
    }
}

pub async fn environment_report(cfg: &ControllerConfig) -> EnvironmentReport {
    let candidates = cfg.script_candidate_paths();
    let script = discovery::resolve_script(&candidates);

    let Interpreter { name, version } = discovery::resolve_interpreter(
        &cfg.interpreter_candidates,
        &cfg.version_arg,
        cfg.probe_timeout(),
        &cfg.default_interpreter,
    )
    .await;

    let log_anchor = script
        .clone()
        .or_else(|| candidates.first().cloned())
        .unwrap_or_else(|| cfg.base_dir.join("main"));
    let log_path = discovery::log_path_for(&log_anchor, &cfg.log_name);
    let log_exists = log_path.is_file();

    EnvironmentReport {
        base_dir: cfg.base_dir.clone(),
        script,
        candidates_checked: candidates,
        interpreter: name,
        interpreter_version: version,
        log_path,
        log_exists,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_resolved_script_and_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("Python/main.py");
        std::fs::create_dir_all(script.parent().unwrap()).unwrap();
        std::fs::write(&script, "print('hi')\n").unwrap();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("logs/bot.log"), "x\n").unwrap();

        let cfg = ControllerConfig {
            base_dir: dir.path().to_path_buf(),
            interpreter_candidates: vec!["true".to_string()],
            ..ControllerConfig::default()
        };
        let report = environment_report(&cfg).await;

        assert_eq!(report.script.as_deref(), Some(script.as_path()));
        assert_eq!(report.interpreter, "true");
        assert!(report.is_ready());
        assert!(report.log_exists);
        assert!(report.lines().iter().any(|l| l.contains("present")));
    }

    #[tokio::test]
    async fn lists_checked_candidates_when_script_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ControllerConfig {
            base_dir: dir.path().to_path_buf(),
            interpreter_candidates: vec!["autobot-missing".to_string()],
            ..ControllerConfig::default()
        };
        let report = environment_report(&cfg).await;

        assert!(report.script.is_none());
        assert!(!report.is_ready());
        assert_eq!(report.interpreter, "python");
        let lines = report.lines();
        assert!(lines.contains(&"script: not found".to_string()));
        assert_eq!(
            lines.iter().filter(|l| l.starts_with("  checked:")).count(),
            cfg.script_candidates.len()
        );
    }
}
