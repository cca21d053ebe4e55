//! Port lookup through the RPC Port Mapper (RFC 1833, version 2).
//!
//! Only used when the user asks for it, the server port is normally
//! given explicitly.
use crate::{
    config::ClientConfig,
    result::{Error, Result},
    rpc::RpcClient,
    xdr::{self, PackTo, Unpacker as _},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// TCP/UDP Port number for the RPC Port Mapper service and RPC bind
pub const PORT: u16 = 111;

pub const PMAP_VERS: u32 = 2;
pub const PMAP_PROG: u32 = 100000;

pub const IPPROTO_TCP: u32 = 6; /* protocol number for TCP/IP */

pub const PMAPPROC_GETPORT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub prog: u32,
    pub vers: u32,
    pub prot: u32,
    pub port: u32,
}

impl<B: xdr::Packer> PackTo<B> for Mapping {
    fn pack_to(&self, buf: &mut B) {
        buf.pack_uint(self.prog);
        buf.pack_uint(self.vers);
        buf.pack_uint(self.prot);
        buf.pack_uint(self.port);
    }
}

pub struct PortmapClient<S> {
    rpc: RpcClient<S>,
}

impl PortmapClient<TcpStream> {
    /// Connects to the portmapper on `host`
    pub async fn connect(host: &str, config: ClientConfig) -> Result<Self> {
        Ok(PortmapClient {
            rpc: RpcClient::connect(host, PORT, config).await?,
        })
    }
}

impl<S> PortmapClient<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(rpc: RpcClient<S>) -> Self {
        PortmapClient { rpc }
    }

    /// Returns the TCP port `prog` version `vers` is registered on
    pub async fn get_port(&self, prog: u32, vers: u32) -> Result<u16> {
        let mapping = Mapping {
            prog,
            vers,
            prot: IPPROTO_TCP,
            port: 0,
        };

        let port = self
            .rpc
            .call(PMAP_PROG, PMAP_VERS, PMAPPROC_GETPORT, &mapping, |buf| {
                buf.unpack_uint()
            })
            .await?;

        match port {
            0 => Err(Error::PortNotRegistered { prog, vers }),
            port => u16::try_from(port)
                .map_err(|_| Error::decode(format!("port {} out of range", port))),
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.rpc.close().await
    }
}

/// Asks the portmapper on `host` where `prog` version `vers` listens
pub async fn get_port(host: &str, prog: u32, vers: u32, config: &ClientConfig) -> Result<u16> {
    let client = PortmapClient::connect(host, config.clone()).await?;
    let res = client.get_port(prog, vers).await;
    // the lookup result matters more than a failed shutdown
    let _ = client.close().await;

    let port = res?;
    debug!(host, prog, vers, port, "portmapper lookup");
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, success};
    use crate::xdr::Packer as _;

    fn serve_port(port: u32) -> PortmapClient<tokio::io::DuplexStream> {
        let (rpc, server) = testing::client_pair(ClientConfig::default());
        testing::spawn_server(server, move |call, mut args| {
            assert_eq!((call.prog, call.vers, call.proc), (100000, 2, 3));
            assert_eq!(args.unpack_uint().unwrap(), 100005);
            assert_eq!(args.unpack_uint().unwrap(), 3);
            assert_eq!(args.unpack_uint().unwrap(), IPPROTO_TCP);
            assert_eq!(args.unpack_uint().unwrap(), 0);
            vec![success(call.xid, |buf| buf.pack_uint(port))]
        });
        PortmapClient::new(rpc)
    }

    #[tokio::test]
    async fn test_get_port() {
        let client = serve_port(20048);
        assert_eq!(client.get_port(100005, 3).await.unwrap(), 20048);
    }

    #[tokio::test]
    async fn test_not_registered() {
        let client = serve_port(0);
        assert!(matches!(
            client.get_port(100005, 3).await,
            Err(Error::PortNotRegistered {
                prog: 100005,
                vers: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_port_out_of_range() {
        let client = serve_port(70000);
        assert!(matches!(
            client.get_port(100005, 3).await,
            Err(Error::Decode(_))
        ));
    }
}
