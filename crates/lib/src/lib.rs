//! Companion core library: gateway client protocol layer, configuration, and the
//! application session shared by the CLI and desktop shell.

pub mod config;
pub mod gateway;
pub mod session;
