//! BlueChat platform backends
//!
//! Implementations of the [`bluechat_core::RadioAdapter`] and
//! [`bluechat_core::SocketFactory`] capabilities:
//!
//! - [`tcp`] - TCP stand-in radio for development and testing on any host
//! - `bluez` - Bluetooth Classic RFCOMM through BlueZ (Linux, feature `bluez`)
//!
//! ## Platform Support
//!
//! - **Linux**: RFCOMM via `bluer` when built with the `bluez` feature
//! - **Everywhere**: TCP backend with a configured peer list

pub mod tcp;

#[cfg(all(feature = "bluez", target_os = "linux"))]
pub mod bluez;

pub use tcp::{TcpRadio, TcpRadioConfig};

#[cfg(all(feature = "bluez", target_os = "linux"))]
pub use bluez::BluezRadio;
