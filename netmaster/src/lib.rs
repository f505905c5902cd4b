//! Network control plane: tenant tag pools, network and endpoint
//! lifecycle, policy and service bookkeeping, and the leader-elected daemon
//! that serves them.

pub mod cfgtool;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod gstate;
pub mod intent;
pub mod master;
pub mod mastercfg;
pub mod objapi;
pub mod objdb;
