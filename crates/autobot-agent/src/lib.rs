pub mod config;
pub mod console;
pub mod controller;
mod controller_support;
pub mod discovery;
pub mod environment;
pub mod listener;
mod process_tree;

pub use config::ControllerConfig;
pub use controller::{ProcessController, StartError};
pub use controller_support::format_error_chain;
pub use discovery::{Interpreter, LaunchSpec};
pub use environment::{EnvironmentReport, environment_report};
pub use listener::{ChannelListener, NoopListener, RunListener};

pub use autobot_process::{FailureReason, Notification, RunId, RunState, RunStatus};
