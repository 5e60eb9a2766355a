use std::time::Duration;

pub(crate) const DEFAULT_GRACE_PERIOD_MS: u64 = 3000;
pub(crate) const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2000;
pub(crate) const DEFAULT_CONSOLE_MAX_LINES: usize = 1000;

// Extra time stop() allows the supervisor to reap the tree after SIGKILL.
pub(crate) const KILL_CONFIRM_SLACK: Duration = Duration::from_millis(500);

// Readers get this long to drain after the child exits; a grandchild that
// keeps a pipe open must not hold the completion notification hostage.
pub(crate) const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn clamp_grace_ms(v: u64) -> u64 {
    v.clamp(100, 60_000)
}

pub(crate) fn clamp_probe_timeout_ms(v: u64) -> u64 {
    v.clamp(100, 30_000)
}

pub(crate) fn clamp_console_lines(v: usize) -> usize {
    v.clamp(100, 50_000)
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

/// Strips the line terminator and decodes lossily; child output is opaque text.
pub(crate) fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    while end > 0 && matches!(buf[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_keep_values_in_range() {
        assert_eq!(clamp_grace_ms(0), 100);
        assert_eq!(clamp_grace_ms(3000), 3000);
        assert_eq!(clamp_grace_ms(u64::MAX), 60_000);
        assert_eq!(clamp_probe_timeout_ms(5), 100);
        assert_eq!(clamp_console_lines(1), 100);
    }

    #[test]
    fn error_chain_dedups_adjacent_messages() {
        let err = anyhow::anyhow!("inner")
            .context("inner")
            .context("read config");
        assert_eq!(format_error_chain(&err), "read config: inner");
    }

    #[test]
    fn decode_line_strips_crlf_and_keeps_inner_whitespace() {
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"  spaced  \n"), "  spaced  ");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }
}
