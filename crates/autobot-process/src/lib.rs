/// Identifier of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The OS refused to create the process.
    Spawn,
    /// The child exited with a non-zero code or was killed by a signal.
    ExitStatus,
    /// The tree was force-killed after the grace period.
    Terminated,
    /// Waiting on the child failed.
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Stopping,
    Completed,
    Failed(FailureReason),
}

impl RunState {
    /// A process handle exists only in these states.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    /// Success flag carried by the completion notification.
    pub fn success(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle | Completed | Failed(_), Starting) => true,
            (Starting, Running) => true,
            (Starting, Failed(FailureReason::Spawn)) => true,
            (Running, Stopping) => true,
            (Running | Stopping, Completed) => true,
            (Running | Stopping, Failed(r)) => r != FailureReason::Spawn,
            (Completed | Failed(_), Idle) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunStatus {
    pub id: Option<RunId>,
    pub state: RunState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

impl RunStatus {
    pub fn idle() -> Self {
        Self {
            id: None,
            state: RunState::Idle,
            pid: None,
            exit_code: None,
            message: None,
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::idle()
    }
}

/// Asynchronous message delivered from the controller to its collaborator.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Output { line: String },
    Error { line: String },
    Completed { success: bool },
}

impl Notification {
    pub fn is_completion(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}
