//! Transport-agnostic bridge logic: register model, poll compiler,
//! scheduler, request queues, the command executor, and the network worker
//! that ties them together.

pub mod compiler;
pub mod executor;
pub mod messages;
pub mod queues;
pub mod register;
pub mod scheduler;
pub mod worker;
