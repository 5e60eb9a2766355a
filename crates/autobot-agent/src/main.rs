use std::sync::Arc;

use anyhow::Context;
use autobot_agent::{ChannelListener, ControllerConfig, Notification, ProcessController};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cfg = match ControllerConfig::load().context("load controller config") {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{}", autobot_agent::format_error_chain(&err));
            std::process::exit(2);
        }
    };

    let mut args = std::env::args().skip(1);
    if args.next().as_deref() == Some("check") {
        let report = autobot_agent::environment_report(&cfg).await;
        if args.next().as_deref() == Some("--json") {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            for line in report.lines() {
                println!("{line}");
            }
        }
        std::process::exit(if report.is_ready() { 0 } else { 1 });
    }

    let (listener, mut rx) = ChannelListener::new();
    let controller = ProcessController::discover(&cfg, Arc::new(listener)).await;
    tracing::info!(
        exec = %controller.launch_spec().exec,
        script = %controller.launch_spec().script.display(),
        log = %controller.resolve_log_path().display(),
        "autobot console ready"
    );

    let stopper = controller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping run");
            stopper.stop().await;
        }
    });

    let run = controller.start();
    tokio::pin!(run);
    let success = loop {
        tokio::select! {
            success = &mut run => break success,
            Some(n) = rx.recv() => print_notification(n),
        }
    };
    // Everything for this run was queued before start() returned.
    while let Ok(n) = rx.try_recv() {
        print_notification(n);
    }

    std::process::exit(if success { 0 } else { 1 });
}

fn print_notification(n: Notification) {
    match n {
        Notification::Output { line } => println!("{line}"),
        Notification::Error { line } => eprintln!("{line}"),
        Notification::Completed { success } => {
            tracing::info!(success, "run completed");
        }
    }
}
