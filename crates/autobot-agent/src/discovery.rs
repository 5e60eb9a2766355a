use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::process::Command;
use tracing::debug;

use crate::config::ControllerConfig;

/// Resolved spawn inputs for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub exec: String,
    /// Script path; may not exist, which start() reports as "not found".
    pub script: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(exec: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            exec: exec.into(),
            script: script.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The child runs in the script's directory.
    pub fn working_dir(&self) -> PathBuf {
        match self.script.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// `<script> [args…]` as passed to the executable.
    pub fn command_args(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.args.len() + 1);
        out.push(self.script.to_string_lossy().to_string());
        out.extend(self.args.iter().cloned());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub name: String,
    /// First line of the version probe; `None` when falling back to the default.
    pub version: Option<String>,
}

/// First candidate that is an existing file.
pub fn resolve_script(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.is_file()).cloned()
}

/// Runs `<name> <arg>` and returns its first output line when it exits 0 in time.
///
/// Some interpreters print their version on stderr, so both streams are checked.
pub async fn probe_interpreter(name: &str, arg: &str, timeout: Duration) -> Option<String> {
    let mut cmd = Command::new(name);
    cmd.arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let out = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(err)) => {
            debug!(interpreter = name, error = %err, "probe failed to spawn");
            return None;
        }
        Err(_) => {
            debug!(interpreter = name, timeout_ms = timeout.as_millis() as u64, "probe timed out");
            return None;
        }
    };

    if !out.status.success() {
        debug!(interpreter = name, code = ?out.status.code(), "probe exited non-zero");
        return None;
    }

    let first_line = |bytes: &[u8]| {
        String::from_utf8_lossy(bytes)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    };
    Some(
        first_line(&out.stdout)
            .or_else(|| first_line(&out.stderr))
            .unwrap_or_default(),
    )
}

/// First candidate whose probe succeeds, else `default` unverified.
pub async fn resolve_interpreter(
    candidates: &[String],
    arg: &str,
    timeout: Duration,
    default: &str,
) -> Interpreter {
    for name in candidates {
        if let Some(version) = probe_interpreter(name, arg, timeout).await {
            return Interpreter {
                name: name.clone(),
                version: Some(version),
            };
        }
    }
    Interpreter {
        name: default.to_string(),
        version: None,
    }
}

/// Full discovery pass driven by configuration.
///
/// An unresolved script still yields a `LaunchSpec` (pointing at the first candidate)
/// so the controller can initialize and report the path on start().
pub async fn discover(cfg: &ControllerConfig) -> (LaunchSpec, Interpreter) {
    let candidates = cfg.script_candidate_paths();
    let script = resolve_script(&candidates)
        .or_else(|| candidates.first().cloned())
        .unwrap_or_else(|| cfg.base_dir.clone());

    let interpreter = resolve_interpreter(
        &cfg.interpreter_candidates,
        &cfg.version_arg,
        cfg.probe_timeout(),
        &cfg.default_interpreter,
    )
    .await;

    let mut spec =
        LaunchSpec::new(interpreter.name.clone(), script).with_args(cfg.script_args.clone());
    for (k, v) in &cfg.env {
        spec = spec.with_env(k, v);
    }
    (spec, interpreter)
}

/// `<script dir>/../logs/<name>.log`.
pub fn log_path_for(script: &Path, log_name: &str) -> PathBuf {
    let script_dir = script.parent().unwrap_or_else(|| Path::new("."));
    let logs = match script_dir.parent() {
        Some(parent) => parent.join("logs"),
        None => script_dir.join("..").join("logs"),
    };
    logs.join(format!("{log_name}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_script_takes_first_existing() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a/main.py");
        let b = dir.path().join("b/main.py");
        let c = dir.path().join("c/main.py");
        for p in [&b, &c] {
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(p, "print('x')\n").unwrap();
        }

        let found = resolve_script(&[a.clone(), b.clone(), c]);
        assert_eq!(found, Some(b));
        assert_eq!(resolve_script(&[a]), None);
    }

    #[test]
    fn resolve_script_ignores_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_script(&[dir.path().to_path_buf()]), None);
    }

    #[test]
    fn launch_spec_runs_in_script_dir() {
        let spec = LaunchSpec::new("python", "/srv/bot/Python/main.py").with_args(["--once"]);
        assert_eq!(spec.working_dir(), PathBuf::from("/srv/bot/Python"));
        assert_eq!(spec.command_args(), ["/srv/bot/Python/main.py", "--once"]);

        let bare = LaunchSpec::new("sh", "run.sh");
        assert_eq!(bare.working_dir(), PathBuf::from("."));
    }

    #[test]
    fn log_path_is_sibling_logs_dir() {
        let p = log_path_for(Path::new("/srv/bot/Python/main.py"), "bot");
        assert_eq!(p, PathBuf::from("/srv/bot/logs/bot.log"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_accepts_zero_exit_and_rejects_missing() {
        let ok = probe_interpreter("true", "--version", Duration::from_secs(2)).await;
        assert!(ok.is_some());

        let missing =
            probe_interpreter("autobot-definitely-missing-bin", "--version", Duration::from_secs(2))
                .await;
        assert!(missing.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_gives_up_on_a_hanging_interpreter() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("slow-python");
        std::fs::write(&exe, "#!/bin/sh\nsleep 10\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let t0 = std::time::Instant::now();
        let found = probe_interpreter(
            exe.to_str().unwrap(),
            "--version",
            Duration::from_millis(300),
        )
        .await;
        assert_eq!(found, None);
        assert!(t0.elapsed() < Duration::from_secs(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_interpreter_falls_back_to_default() {
        let found = resolve_interpreter(
            &["autobot-missing-a".to_string(), "autobot-missing-b".to_string()],
            "--version",
            Duration::from_millis(500),
            "python",
        )
        .await;
        assert_eq!(
            found,
            Interpreter {
                name: "python".to_string(),
                version: None
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_interpreter_skips_failing_candidates() {
        let found = resolve_interpreter(
            &["false".to_string(), "true".to_string()],
            "--version",
            Duration::from_secs(2),
            "python",
        )
        .await;
        assert_eq!(found.name, "true");
        assert!(found.version.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn discover_points_at_first_candidate_when_nothing_exists() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ControllerConfig {
            base_dir: dir.path().to_path_buf(),
            script_candidates: vec![PathBuf::from("x/main.py"), PathBuf::from("y/main.py")],
            interpreter_candidates: vec!["autobot-missing".to_string()],
            probe_timeout_ms: 500,
            ..ControllerConfig::default()
        };
        let (spec, interp) = discover(&cfg).await;
        assert_eq!(spec.script, dir.path().join("x/main.py"));
        assert_eq!(spec.exec, "python");
        assert!(interp.version.is_none());
    }
}
