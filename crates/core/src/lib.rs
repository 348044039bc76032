//! Core crate for the upload optimizer proxy.

pub mod config;
pub mod gate;
pub mod immich;
pub mod jobs;
pub mod logging;
pub mod pipeline;
pub mod redirect;
pub mod server;
pub mod task;
pub mod upstream;
pub mod watcher;
