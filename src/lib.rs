//! Library crate for host-recon-rs exposing reusable modules.
pub mod config;
pub mod discovery;
pub mod error;
pub mod gate;
pub mod logs;
pub mod manual;
pub mod patterns;
pub mod ports;
pub mod scheduler;
pub mod template;
pub mod types;
