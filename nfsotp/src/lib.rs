//! A client for the one-time password extension of the NFS MOUNT
//! protocol: ONC RPC over TCP, XDR encoding, the MNT procedure, and the
//! OTP derivation on top.

pub mod config;
pub mod mount;
pub mod otp;
pub mod portmap;
pub mod record;
pub mod result;
pub mod rpc;
#[cfg(test)]
mod testing;
pub mod transport;
pub mod xdr;

pub use config::ClientConfig;
pub use otp::{derive_otp, OtpClient};
pub use result::{Error, Result};
