use autobot_process::Notification;
use tokio::sync::mpsc;

/// Receives run notifications, possibly from a runtime worker thread.
///
/// Implementations must not block; marshal to the UI thread if needed.
pub trait RunListener: Send + Sync {
    fn on_output_line(&self, line: &str);
    fn on_error_line(&self, line: &str);
    fn on_completed(&self, success: bool);
}

/// Forwards every notification into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, n: Notification) {
        // A dropped receiver just means nobody is watching the console.
        let _ = self.tx.send(n);
    }
}

impl RunListener for ChannelListener {
    fn on_output_line(&self, line: &str) {
        self.send(Notification::Output {
            line: line.to_string(),
        });
    }

    fn on_error_line(&self, line: &str) {
        self.send(Notification::Error {
            line: line.to_string(),
        });
    }

    fn on_completed(&self, success: bool) {
        self.send(Notification::Completed { success });
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl RunListener for NoopListener {
    fn on_output_line(&self, _line: &str) {}
    fn on_error_line(&self, _line: &str) {}
    fn on_completed(&self, _success: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_listener_preserves_order() {
        let (l, mut rx) = ChannelListener::new();
        l.on_output_line("a");
        l.on_error_line("b");
        l.on_completed(true);

        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::Output {
                line: "a".to_string()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::Error {
                line: "b".to_string()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::Completed { success: true }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_after_receiver_dropped_is_silent() {
        let (l, rx) = ChannelListener::new();
        drop(rx);
        l.on_output_line("nobody listens");
    }
}
