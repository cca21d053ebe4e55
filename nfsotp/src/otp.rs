//! One-time passwords from server-issued nonces.
//!
//! The server hands out a nonce as the file handle of a MNT call for
//! [`GET_NONCE`].  The OTP is the hex MD5 digest of the nonce bytes
//! immediately followed by the secret bytes, which is what the server
//! computes on its side.  MD5 is weak, but it is what the server
//! verifies against, so it cannot be swapped out here.
use crate::{
    config::ClientConfig,
    mount::{MountClient, MountCommand, MountResult, GET_NONCE},
    result::{Error, Result},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Length of the hex digest
pub const OTP_LEN: usize = 32;

/// Derives the OTP for a nonce and secret
pub fn derive_otp(nonce: &[u8], secret: &[u8]) -> String {
    let mut input = Vec::with_capacity(nonce.len() + secret.len());
    input.extend_from_slice(nonce);
    input.extend_from_slice(secret);

    hex::encode(md5::compute(&input).0)
}

/// Gets nonces from a server and turns them into OTPs
pub struct OtpClient<S> {
    mount: MountClient<S>,
}

impl OtpClient<TcpStream> {
    pub async fn connect(host: &str, port: u16, config: ClientConfig) -> Result<Self> {
        Ok(OtpClient::new(MountClient::connect(host, port, config).await?))
    }
}

impl<S> OtpClient<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(mount: MountClient<S>) -> Self {
        OtpClient { mount }
    }

    /// Fetches a fresh nonce.  A non-OK mount status fails with
    /// `Error::Otp`.
    pub async fn get_nonce(&self) -> Result<bytes::Bytes> {
        match self.mount.mount(GET_NONCE).await? {
            Ok(res_ok) => {
                debug!(len = res_ok.handle.len(), "got nonce");
                Ok(res_ok.handle)
            }
            Err(stat) => Err(Error::Otp(stat)),
        }
    }

    /// Fetches a nonce and derives the OTP for `secret` from it
    pub async fn get_otp(&self, secret: &[u8]) -> Result<String> {
        let nonce = self.get_nonce().await?;
        Ok(derive_otp(&nonce, secret))
    }

    /// Mounts `export` authenticated by an OTP for `secret`.  The server
    /// replaces its nonce after checking the OTP, so every mount takes a
    /// fresh one.
    pub async fn mount_with_otp(&self, export: &str, secret: &[u8]) -> Result<MountResult> {
        let otp = self.get_otp(secret).await?;
        self.mount
            .mount_command(&MountCommand::Otp {
                otp: &otp,
                path: export,
            })
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.mount.close().await
    }
}

/// Connects to `host:port`, fetches a nonce and returns the OTP for
/// `secret`.
pub async fn get_otp(host: &str, port: u16, secret: &[u8], config: ClientConfig) -> Result<String> {
    let client = OtpClient::connect(host, port, config).await?;
    let res = client.get_otp(secret).await;
    let _ = client.close().await;
    res
}
