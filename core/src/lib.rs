extern crate self as helm_core;

pub mod core;
pub mod lifecycle;
pub mod log;
pub mod panic;
pub mod service;
pub mod signals;
pub mod subsystems;
pub mod task;
