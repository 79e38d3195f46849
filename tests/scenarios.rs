//! End-to-end scenarios driving the scheduler/queues/executor pipeline
//! together against an in-memory fake transport, without any real wire I/O.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use modmqtt_bridge::core::executor::Executor;
use modmqtt_bridge::core::queues::{QueuedCommand, RequestQueues};
use modmqtt_bridge::core::register::{
    DelayPolicy, RegisterPoll, RegisterRef, RegisterType, RegisterWrite, WriteValues,
};
use modmqtt_bridge::core::scheduler::Scheduler;
use modmqtt_bridge::error::TransportError;
use modmqtt_bridge::transport::Transport;

struct FakeTransport {
    values: HashMap<(u8, RegisterType, u16), u16>,
    fail_next_read: bool,
}

impl FakeTransport {
    fn new() -> Self {
        Self {
            values: HashMap::new(),
            fail_next_read: false,
        }
    }

    fn set(&mut self, slave: u8, kind: RegisterType, register: u16, value: u16) {
        self.values.insert((slave, kind, register), value);
    }
}

impl Transport for FakeTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
    fn disconnect(&mut self) {}
    fn is_connected(&self) -> bool {
        true
    }

    fn read_block(
        &mut self,
        slave: u8,
        kind: RegisterType,
        first_register: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        if self.fail_next_read {
            self.fail_next_read = false;
            return Err(TransportError::Timeout);
        }
        Ok((0..count)
            .map(|i| {
                self.values
                    .get(&(slave, kind, first_register + i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    fn write_block(
        &mut self,
        slave: u8,
        kind: RegisterType,
        first_register: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        for (i, v) in values.iter().enumerate() {
            self.values.insert((slave, kind, first_register + i as u16), *v);
        }
        Ok(())
    }
}

fn holding(slave: u8, first: u16, count: u16) -> RegisterRef {
    RegisterRef {
        slave,
        first_register: first,
        count,
        kind: RegisterType::Holding,
    }
}

#[test]
fn write_only_register_never_polled_gets_no_echo() {
    let mut transport = FakeTransport::new();
    let mut executor = Executor::new();

    let write = RegisterWrite {
        target: holding(1, 10, 1),
        values: vec![77],
        echo: None, // worker only sets Some(..) when the register overlaps a poll
        delay: DelayPolicy::NEVER,
    };
    let msgs = executor.execute_write(&mut transport, write, Instant::now());
    assert!(msgs.is_empty());
    assert_eq!(transport.values[&(1, RegisterType::Holding, 10)], 77);
}

#[test]
fn per_slave_delay_blocks_until_silence_elapses() {
    let mut queues = RequestQueues::new(10);
    let slave_delay = DelayPolicy::every_time(Duration::from_millis(200));
    queues.refill_polls(vec![(5, holding(5, 1, 1), slave_delay)]);

    // No time has passed since the (hypothetical) last command: not eligible yet.
    let cmd = queues.pop_first_with_silence(Duration::from_millis(50), Some(5), |_| None);
    assert!(cmd.is_none());

    // Enough silence has now elapsed.
    let cmd = queues.pop_first_with_silence(Duration::from_millis(250), Some(5), |_| None);
    assert!(matches!(cmd, Some(QueuedCommand::Poll(_))));
}

#[test]
fn global_delay_before_command_applies_every_time() {
    let mut queues = RequestQueues::new(10);
    let global_every_time = DelayPolicy::every_time(Duration::from_millis(100));
    queues.refill_polls(vec![
        (1, holding(1, 1, 1), global_every_time),
        (1, holding(1, 5, 1), global_every_time),
    ]);

    // First poll to slave 1: no prior command, so elapsed is effectively infinite.
    let first = queues
        .pop_first_with_silence(Duration::MAX, None, |_| None)
        .expect("first poll always eligible");
    assert!(matches!(first, QueuedCommand::Poll(_)));

    // Immediately after, the second poll to the same slave still needs the
    // full delay again under EveryTime, regardless of same-slave continuity.
    let blocked = queues.pop_first_with_silence(Duration::from_millis(10), Some(1), |_| None);
    assert!(blocked.is_none());
}

#[test]
fn delay_before_first_command_only_skips_on_same_slave() {
    let mut queues = RequestQueues::new(10);
    let on_change = DelayPolicy::on_slave_change(Duration::from_millis(100));
    queues.refill_polls(vec![
        (2, holding(2, 1, 1), on_change),
        (2, holding(2, 5, 1), on_change),
    ]);

    let first = queues
        .pop_first_with_silence(Duration::MAX, None, |_| None)
        .expect("first poll eligible with no prior slave");
    assert!(matches!(first, QueuedCommand::Poll(_)));

    // Same slave as last_slave: OnSlaveChange requires zero additional silence.
    let second = queues.pop_first_with_silence(Duration::ZERO, Some(2), |_| None);
    assert!(matches!(second, Some(QueuedCommand::Poll(_))));
}

#[test]
fn reconnect_makes_every_poll_due_again_before_any_repeats() {
    let mut scheduler = Scheduler::new();
    let register = holding(1, 1, 1);
    let mut map = HashMap::new();
    map.insert(1, vec![RegisterPoll::new(register, Duration::from_secs(60), DelayPolicy::NEVER)]);
    scheduler.set_spec(map);

    let now = Instant::now();
    scheduler.mark_read(&register, now);
    let (due, _) = scheduler.get_registers_to_poll(now);
    assert!(due.is_empty(), "freshly read poll is not due again within its refresh window");

    scheduler.reset_epoch();
    let (due, _) = scheduler.get_registers_to_poll(now);
    assert_eq!(due[&1].len(), 1, "reconnect resets every poll's epoch");
}

#[test]
fn successful_write_to_a_polled_register_echoes_immediately() {
    let mut transport = FakeTransport::new();
    let mut executor = Executor::new();
    let target = holding(3, 1, 1);

    let echo = WriteValues {
        slave: 3,
        kind: RegisterType::Holding,
        first_register: 1,
        values: vec![123],
    };
    let write = RegisterWrite {
        target,
        values: vec![123],
        echo: Some(echo),
        delay: DelayPolicy::NEVER,
    };

    let msgs = executor.execute_write(&mut transport, write, Instant::now());
    assert_eq!(msgs.len(), 1);
    match &msgs[0] {
        modmqtt_bridge::core::messages::FromNetwork::RegisterValues { values, .. } => {
            assert_eq!(values, &vec![123]);
        }
        other => panic!("expected RegisterValues echo, got {other:?}"),
    }
}
