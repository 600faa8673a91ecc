//! Workbench - short-lived, browser-accessible coding workspaces.
//!
//! A client uploads a project archive, the server materializes it into an
//! isolated runtime (a namespace sandbox, or a plain subprocess environment
//! on hosts without root), and the client interacts with it through a
//! streamed terminal and a file API.

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

pub mod archive;
pub mod config;
pub mod error;
pub mod files;
pub mod http_server;
pub mod pty;
pub mod runtime;
pub mod state;
pub mod store;
pub mod terminal;

pub use error::{Error, Result};
