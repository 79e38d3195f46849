//! Scheduler: holds the compiled polls, decides what is due and when
//! the worker should next wake up to check again.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::register::{RegisterPoll, RegisterRef, SlaveAddress};

/// Output of the poll compiler: the grouped, refresh-tagged polls per
/// slave, ready to hand to a `Scheduler`.
pub type PollSpec = HashMap<SlaveAddress, Vec<RegisterPoll>>;

#[derive(Default)]
pub struct Scheduler {
    polls: PollSpec,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wholesale replacement; resets all `last_read_at`/`initial_done`.
    pub fn set_spec(&mut self, map: PollSpec) {
        self.polls = map;
    }

    /// Reset every poll's epoch state — used on reconnect (epoch
    /// freshness property).
    pub fn reset_epoch(&mut self) {
        for polls in self.polls.values_mut() {
            for poll in polls.iter_mut() {
                poll.reset_epoch();
            }
        }
    }

    pub fn find_register_poll(&self, reference: &RegisterRef) -> Option<&RegisterPoll> {
        self.polls
            .get(&reference.slave)?
            .iter()
            .find(|p| p.register.overlaps(reference) || p.register == *reference)
    }

    pub fn find_register_poll_mut(&mut self, reference: &RegisterRef) -> Option<&mut RegisterPoll> {
        self.polls
            .get_mut(&reference.slave)?
            .iter_mut()
            .find(|p| p.register.overlaps(reference) || p.register == *reference)
    }

    pub fn is_empty(&self) -> bool {
        self.polls.values().all(|v| v.is_empty())
    }

    /// Every poll whose deadline has passed, keyed by slave, plus the
    /// minimum remaining time across non-due polls (`Duration::MAX` when
    /// the spec is empty).
    pub fn get_registers_to_poll(
        &mut self,
        now: Instant,
    ) -> (HashMap<SlaveAddress, Vec<RegisterRef>>, Duration) {
        let mut due: HashMap<SlaveAddress, Vec<RegisterRef>> = HashMap::new();
        let mut sleep_until_next = Duration::MAX;

        for (slave, polls) in self.polls.iter() {
            for poll in polls {
                if poll.is_due(now) {
                    due.entry(*slave).or_default().push(poll.register);
                } else {
                    sleep_until_next = sleep_until_next.min(poll.remaining(now));
                }
            }
        }
        (due, sleep_until_next)
    }

    pub fn mark_read(&mut self, reference: &RegisterRef, now: Instant) {
        if let Some(poll) = self.find_register_poll_mut(reference) {
            poll.mark_read(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register::{DelayPolicy, RegisterType};

    fn poll(slave: SlaveAddress, first: u16, refresh_ms: u64) -> RegisterPoll {
        RegisterPoll::new(
            RegisterRef {
                slave,
                first_register: first,
                count: 1,
                kind: RegisterType::Holding,
            },
            Duration::from_millis(refresh_ms),
            DelayPolicy::NEVER,
        )
    }

    #[test]
    fn unread_polls_are_always_due() {
        let mut sched = Scheduler::new();
        let mut map = HashMap::new();
        map.insert(1, vec![poll(1, 1, 10_000)]);
        sched.set_spec(map);

        let (due, sleep) = sched.get_registers_to_poll(Instant::now());
        assert_eq!(due[&1].len(), 1);
        assert_eq!(sleep, Duration::MAX);
    }

    #[test]
    fn empty_spec_sleeps_forever() {
        let mut sched = Scheduler::new();
        let (due, sleep) = sched.get_registers_to_poll(Instant::now());
        assert!(due.is_empty());
        assert_eq!(sleep, Duration::MAX);
    }

    #[test]
    fn reset_epoch_makes_everything_due_again() {
        let mut sched = Scheduler::new();
        let mut map = HashMap::new();
        map.insert(1, vec![poll(1, 1, 10_000)]);
        sched.set_spec(map);
        let now = Instant::now();
        sched.mark_read(
            &RegisterRef {
                slave: 1,
                first_register: 1,
                count: 1,
                kind: RegisterType::Holding,
            },
            now,
        );
        let (due, _) = sched.get_registers_to_poll(now);
        assert!(due.is_empty());

        sched.reset_epoch();
        let (due, _) = sched.get_registers_to_poll(now);
        assert_eq!(due[&1].len(), 1);
    }
}
