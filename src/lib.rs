//! Object storage on top of a chat platform.
//!
//! Folders are text channels, objects are threads and an object's bytes are
//! the attachments of the thread's messages, split into parts small enough
//! for the platform's upload limit.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod transport;
