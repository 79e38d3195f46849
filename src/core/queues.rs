//! Request queues: a poll ring and a bounded write FIFO, interleaved
//! under alternation, with a bounded-window search for the first command
//! whose required silence is already satisfied.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::register::{RegisterRef, RegisterType, RegisterWrite, SlaveAddress};

pub const DEFAULT_MAX_WRITE_QUEUE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct PollCommand {
    pub slave: SlaveAddress,
    pub register: RegisterRef,
    pub delay: super::register::DelayPolicy,
}

#[derive(Debug, Clone)]
pub enum QueuedCommand {
    Poll(PollCommand),
    Write(RegisterWrite),
}

impl QueuedCommand {
    pub fn slave(&self) -> SlaveAddress {
        match self {
            QueuedCommand::Poll(p) => p.slave,
            QueuedCommand::Write(w) => w.target.slave,
        }
    }

    pub fn delay(&self, slave_delay_override: Option<super::register::DelayPolicy>) -> super::register::DelayPolicy {
        match self {
            QueuedCommand::Poll(p) => slave_delay_override.unwrap_or(p.delay),
            QueuedCommand::Write(w) => slave_delay_override.unwrap_or(w.delay),
        }
    }
}

/// One rejected write per overflow: reject newest, because the
/// bus already accepted the command and silently dropping it would lose
/// user intent; rejecting the oldest queued write would be more surprising.
pub struct EnqueueOverflow {
    pub rejected: RegisterWrite,
}

pub struct RequestQueues {
    poll_queue: VecDeque<PollCommand>,
    write_queue: VecDeque<RegisterWrite>,
    max_write_queue_size: usize,
    low_watermark: usize,
    high_watermark: usize,
    usage_low: bool,
    /// Toggle for poll/write alternation; an empty side is skipped.
    pop_from_poll: bool,
    /// Cached scan position for the delay-aware pop (amortized O(1) for
    /// in-order polls).
    last_poll_scan: usize,
}

impl RequestQueues {
    pub fn new(max_write_queue_size: usize) -> Self {
        Self {
            poll_queue: VecDeque::new(),
            write_queue: VecDeque::new(),
            max_write_queue_size,
            low_watermark: max_write_queue_size / 10,
            high_watermark: (max_write_queue_size * 9) / 10,
            usage_low: true,
            pop_from_poll: true,
            last_poll_scan: 0,
        }
    }

    pub fn refill_polls(&mut self, due: Vec<(SlaveAddress, RegisterRef, super::register::DelayPolicy)>) {
        for (slave, register, delay) in due {
            self.poll_queue.push_back(PollCommand { slave, register, delay });
        }
        self.last_poll_scan = 0;
    }

    /// Enqueue a write; rejects the newest write if the bound is exceeded.
    pub fn enqueue_write(&mut self, write: RegisterWrite) -> Result<(), EnqueueOverflow> {
        if self.write_queue.len() >= self.max_write_queue_size {
            return Err(EnqueueOverflow { rejected: write });
        }
        self.write_queue.push_back(write);
        self.update_watermark();
        Ok(())
    }

    fn update_watermark(&mut self) {
        let len = self.write_queue.len();
        if len <= self.low_watermark {
            self.usage_low = true;
        } else if len >= self.high_watermark {
            self.usage_low = false;
        }
    }

    pub fn usage_low(&self) -> bool {
        self.usage_low
    }

    pub fn write_queue_len(&self) -> usize {
        self.write_queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poll_queue.is_empty() && self.write_queue.is_empty()
    }

    /// Pop following strict poll/write alternation, skipping an empty side.
    pub fn pop_next(&mut self) -> Option<QueuedCommand> {
        let from_poll = if self.poll_queue.is_empty() {
            false
        } else if self.write_queue.is_empty() {
            true
        } else {
            self.pop_from_poll
        };

        if from_poll {
            self.pop_from_poll = false;
            self.poll_queue.pop_front().map(QueuedCommand::Poll)
        } else {
            self.pop_from_poll = true;
            let w = self.write_queue.pop_front();
            if w.is_some() {
                self.update_watermark();
            }
            w.map(QueuedCommand::Write)
        }
    }

    /// Return the first command whose minimum required silence is already
    /// satisfied by `elapsed_since_last`. If none qualifies, returns the
    /// alternation-ordered head and the caller is expected to sleep the
    /// residual delay of that head command.
    pub fn pop_first_with_silence(
        &mut self,
        elapsed_since_last: Duration,
        last_slave: Option<SlaveAddress>,
        slave_delay_override: impl Fn(SlaveAddress) -> Option<super::register::DelayPolicy>,
    ) -> Option<QueuedCommand> {
        // Scan the poll queue from the cached position first; polls are the
        // common case and usually already eligible.
        let len = self.poll_queue.len();
        if len > 0 {
            let start = self.last_poll_scan.min(len - 1);
            for offset in 0..len {
                let idx = (start + offset) % len;
                let cmd = &self.poll_queue[idx];
                let delay = slave_delay_override(cmd.slave).unwrap_or(cmd.delay);
                let required = delay.required_silence(cmd.slave, last_slave);
                if required <= elapsed_since_last {
                    self.last_poll_scan = idx;
                    let cmd = self.poll_queue.remove(idx).expect("idx in bounds");
                    return Some(QueuedCommand::Poll(cmd));
                }
            }
        }

        for (idx, write) in self.write_queue.iter().enumerate() {
            let delay = slave_delay_override(write.target.slave).unwrap_or(write.delay);
            let required = delay.required_silence(write.target.slave, last_slave);
            if required <= elapsed_since_last {
                let write = self.write_queue.remove(idx).expect("idx in bounds");
                self.update_watermark();
                return Some(QueuedCommand::Write(write));
            }
        }

        self.pop_next()
    }

    /// The minimum missing silence across the head of both queues, used by
    /// the executor to decide how long to sleep before re-asking.
    pub fn min_missing_silence(
        &self,
        elapsed_since_last: Duration,
        last_slave: Option<SlaveAddress>,
        slave_delay_override: impl Fn(SlaveAddress) -> Option<super::register::DelayPolicy>,
    ) -> Option<Duration> {
        let mut min_missing: Option<Duration> = None;
        for cmd in self.poll_queue.iter() {
            let delay = slave_delay_override(cmd.slave).unwrap_or(cmd.delay);
            let required = delay.required_silence(cmd.slave, last_slave);
            if required > elapsed_since_last {
                let missing = required - elapsed_since_last;
                min_missing = Some(min_missing.map_or(missing, |m| m.min(missing)));
            }
        }
        for write in self.write_queue.iter() {
            let delay = slave_delay_override(write.target.slave).unwrap_or(write.delay);
            let required = delay.required_silence(write.target.slave, last_slave);
            if required > elapsed_since_last {
                let missing = required - elapsed_since_last;
                min_missing = Some(min_missing.map_or(missing, |m| m.min(missing)));
            }
        }
        min_missing
    }
}

pub fn rejects_register_type(kind: RegisterType) -> bool {
    !kind.is_writable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register::{DelayPolicy, RegisterType};

    fn write(slave: SlaveAddress) -> RegisterWrite {
        RegisterWrite {
            target: RegisterRef {
                slave,
                first_register: 1,
                count: 1,
                kind: RegisterType::Holding,
            },
            values: vec![7],
            echo: None,
            delay: DelayPolicy::NEVER,
        }
    }

    #[test]
    fn overflow_rejects_newest() {
        let mut q = RequestQueues::new(2);
        q.enqueue_write(write(1)).unwrap();
        q.enqueue_write(write(2)).unwrap();
        let err = q.enqueue_write(write(3)).unwrap_err();
        assert_eq!(err.rejected.target.slave, 3);
        assert_eq!(q.write_queue_len(), 2);
    }

    #[test]
    fn alternation_skips_empty_side() {
        let mut q = RequestQueues::new(10);
        q.enqueue_write(write(1)).unwrap();
        q.enqueue_write(write(2)).unwrap();
        assert!(matches!(q.pop_next(), Some(QueuedCommand::Write(_))));
        assert!(matches!(q.pop_next(), Some(QueuedCommand::Write(_))));
        assert!(q.pop_next().is_none());
    }

    #[test]
    fn watermark_hysteresis() {
        let mut q = RequestQueues::new(10); // low=1, high=9
        assert!(q.usage_low());
        for i in 0..9 {
            q.enqueue_write(write(i)).unwrap();
        }
        assert!(!q.usage_low());
        for _ in 0..8 {
            q.pop_next();
        }
        // still above low watermark (1 remaining), so unchanged
        assert!(!q.usage_low());
        q.pop_next();
        assert!(q.usage_low());
    }

    #[test]
    fn delay_aware_pop_skips_ineligible_head() {
        let mut q = RequestQueues::new(10);
        q.refill_polls(vec![
            (1, RegisterRef { slave: 1, first_register: 1, count: 1, kind: RegisterType::Holding }, DelayPolicy::every_time(Duration::from_millis(500))),
            (2, RegisterRef { slave: 2, first_register: 1, count: 1, kind: RegisterType::Holding }, DelayPolicy::NEVER),
        ]);
        let cmd = q
            .pop_first_with_silence(Duration::from_millis(0), None, |_| None)
            .unwrap();
        match cmd {
            QueuedCommand::Poll(p) => assert_eq!(p.slave, 2),
            _ => panic!("expected poll"),
        }
    }

    #[test]
    fn write_honors_its_own_delay_policy() {
        let mut q = RequestQueues::new(10);
        q.enqueue_write(RegisterWrite {
            target: RegisterRef { slave: 1, first_register: 1, count: 1, kind: RegisterType::Holding },
            values: vec![1],
            echo: None,
            delay: DelayPolicy::every_time(Duration::from_millis(500)),
        })
        .unwrap();

        assert!(q
            .pop_first_with_silence(Duration::from_millis(100), Some(1), |_| None)
            .is_none());
        assert!(matches!(
            q.pop_first_with_silence(Duration::from_millis(500), Some(1), |_| None),
            Some(QueuedCommand::Write(_))
        ));
    }
}
