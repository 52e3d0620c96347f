//! AdaBank transaction broker: shared library used by the `bank-server`,
//! `bank-teller`, and `bank-client` binaries (`src/bin/`).

pub mod account;
pub mod config;
pub mod engine;
pub mod fifo;
pub mod log;
pub mod protocol;
pub mod queue;
pub mod shm;
pub mod shutdown;
pub mod transaction;
