use std::collections::VecDeque;

use autobot_process::Notification;

/// Bounded history of notifications for collaborators that poll.
#[derive(Debug)]
pub struct ConsoleBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, Notification)>,
}

impl ConsoleBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push(&mut self, n: Notification) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, n));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Entries after `cursor`, plus the cursor to pass next time.
    ///
    /// Cursor 0 returns the most recent `limit` entries.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<Notification>, u64) {
        let first = if cursor == 0 {
            self.lines.len().saturating_sub(limit)
        } else {
            self.lines.partition_point(|(seq, _)| *seq <= cursor)
        };
        let page: Vec<_> = self.lines.range(first..).take(limit).collect();
        let next = page.last().map_or(cursor, |(seq, _)| *seq);
        (page.into_iter().map(|(_, n)| n.clone()).collect(), next)
    }

    /// Drops history; sequence numbers keep increasing so old cursors stay valid.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
