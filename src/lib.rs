//! A multi-listener, read-only TFTP server (RFC 1350 subset) with
//! structured per-transfer events.

pub mod config;
pub mod events;
pub mod server;
pub mod session;
pub mod tftp_protocol;
