//! Bridge between an MQTT bus and one or more Modbus RTU/TCP fieldbus
//! networks: register polling/writing, strict serial timing, and topic
//! translation, split into a transport-agnostic `core`, pluggable
//! `transport` backends, and an MQTT `bus` side.

pub mod bus;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod transport;
