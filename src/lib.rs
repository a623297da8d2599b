#[macro_use]
extern crate tracing;

pub mod backend;
pub mod command;
pub mod composite;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod iovec;
pub mod lock;
pub mod logger;
pub mod opcode;
pub mod primitives;
pub mod sense;
pub mod test_support;
pub mod tracker;
pub mod transport;
pub mod worker_pool;
