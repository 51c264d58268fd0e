pub mod args;
pub mod config;
pub mod daemon;
pub mod getwork;
pub mod lines;
pub mod p2p;
pub mod rpc;
pub mod scheduler;
