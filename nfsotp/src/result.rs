//! Error type shared by every layer of the client.
use crate::{
    mount::MountStat3,
    rpc::{AcceptedReplyStat, RejectedReply},
};
use thiserror::Error;

/// Every failure is terminal for the call that produced it; nothing in
/// this crate retries on its own.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport could not be established
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Read or write failure, including premature end of stream
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed record marking
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed XDR data
    #[error("decode error: {0}")]
    Decode(String),

    /// No matching reply arrived in time
    #[error("no reply to xid {xid:#x} within {timeout_ms} ms")]
    Timeout { xid: u32, timeout_ms: u128 },

    /// The server denied the call
    #[error("rpc call denied: {0}")]
    RpcAuth(RejectedReply),

    /// The call was accepted but the procedure did not run
    #[error("rpc call failed: {0}")]
    RpcProcedure(AcceptedReplyStat),

    /// MNT succeeded at the RPC level but returned a non-OK status
    #[error("failed to get nonce: {0}")]
    Otp(MountStat3),

    /// Rejected on the client before anything was sent
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The portmapper has no TCP registration for the program
    #[error("program {prog} version {vers} is not registered with the portmapper")]
    PortNotRegistered { prog: u32, vers: u32 },
}

impl Error {
    pub(crate) fn decode(msg: impl Into<String>) -> Error {
        Error::Decode(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Error {
        Error::Protocol(msg.into())
    }

    /// The error returned to calls that were pending or issued after the
    /// connection went away.
    pub(crate) fn closed(kind: std::io::ErrorKind) -> Error {
        Error::Io(std::io::Error::new(kind, "connection closed"))
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_err: std::string::FromUtf8Error) -> Error {
        Error::decode("string is not valid utf-8")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
