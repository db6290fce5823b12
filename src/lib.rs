//! Library code for the kernel gateway: provisions and multiplexes
//! long-lived Jupyter-protocol kernel subprocesses, exposing them over HTTP
//! and WebSockets either as a raw kernel/session surface or as a
//! notebook-as-API surface.

#![deny(unsafe_code)]

pub mod app;
pub mod bridge;
pub mod config;
pub mod error;
pub mod http;
pub mod kernel;
pub mod kernelspec;
pub mod manager;
pub mod notebook;
pub mod pool;
pub mod session;
pub mod wire;
