#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod amms;
pub mod batch;
pub mod config;
pub mod polling;
pub mod scheduler;
pub mod state;
pub mod subscriber;
pub mod types;
