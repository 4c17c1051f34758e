pub mod agent;
pub mod backend;
pub mod bridge;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod gemini;
pub mod helpers;
pub mod keys;
pub mod protocol;
pub mod pty;
pub mod remote;
pub mod server;
