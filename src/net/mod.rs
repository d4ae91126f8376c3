//! Network-address parsing: listener interfaces and request authorities.

pub mod address;
pub mod host;

pub use address::InterfaceAddress;
pub use host::HostInfo;
