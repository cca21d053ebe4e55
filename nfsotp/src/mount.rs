//! This modules defines the constants and structures for encoding and
//! decoding the NFS MOUNT protocol (RFC 1813 appendix I), and a client
//! for its MNT procedure.
use crate::{
    config::ClientConfig,
    result::{Error, Result},
    rpc::RpcClient,
    transport::Transport,
    xdr::{self, PackTo, UnpackFrom},
};
use bytes::Bytes;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

pub const PROGRAM: u32 = 100005;
pub const VERSION: u32 = 3;

pub const MOUNTPROC3_MNT: u32 = 1;

/// Maximum bytes in a path name
pub const MNTPATHLEN: usize = 1024;
/// Maximum bytes in a V3 file handle
pub const FHSIZE3: usize = 64;

/// Longest `@password:` or `@otp:` argument the server keeps, anything
/// past it is cut off on the server side
pub const PASSWORD_MAXLEN: usize = 64;

/// Dirpath asking the server for a fresh nonce instead of a mount
pub const GET_NONCE: &str = "@getnonce";
const OTP_PREFIX: &str = "@otp:";
const PASSWORD_PREFIX: &str = "@password:";

/// Identity of the MOUNT program on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountProtocol {
    pub program: u32,
    pub version: u32,
    pub mnt: u32,
}

impl Default for MountProtocol {
    fn default() -> Self {
        MountProtocol {
            program: PROGRAM,
            version: VERSION,
            mnt: MOUNTPROC3_MNT,
        }
    }
}

/// mountstat3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStat3 {
    Ok,
    Perm,
    NoEnt,
    Io,
    Acces,
    NotDir,
    Inval,
    NameTooLong,
    NotSupp,
    ServerFault,
    /// A code outside RFC 1813
    Unknown(u32),
}

impl MountStat3 {
    pub fn from_u32(n: u32) -> MountStat3 {
        match n {
            0 => MountStat3::Ok,
            1 => MountStat3::Perm,
            2 => MountStat3::NoEnt,
            5 => MountStat3::Io,
            13 => MountStat3::Acces,
            20 => MountStat3::NotDir,
            22 => MountStat3::Inval,
            63 => MountStat3::NameTooLong,
            10004 => MountStat3::NotSupp,
            10006 => MountStat3::ServerFault,
            n => MountStat3::Unknown(n),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            MountStat3::Ok => 0,
            MountStat3::Perm => 1,
            MountStat3::NoEnt => 2,
            MountStat3::Io => 5,
            MountStat3::Acces => 13,
            MountStat3::NotDir => 20,
            MountStat3::Inval => 22,
            MountStat3::NameTooLong => 63,
            MountStat3::NotSupp => 10004,
            MountStat3::ServerFault => 10006,
            MountStat3::Unknown(n) => *n,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MountStat3::Ok => "MNT3_OK",
            MountStat3::Perm => "MNT3ERR_PERM",
            MountStat3::NoEnt => "MNT3ERR_NOENT",
            MountStat3::Io => "MNT3ERR_IO",
            MountStat3::Acces => "MNT3ERR_ACCES",
            MountStat3::NotDir => "MNT3ERR_NOTDIR",
            MountStat3::Inval => "MNT3ERR_INVAL",
            MountStat3::NameTooLong => "MNT3ERR_NAMETOOLONG",
            MountStat3::NotSupp => "MNT3ERR_NOTSUPP",
            MountStat3::ServerFault => "MNT3ERR_SERVERFAULT",
            MountStat3::Unknown(_) => "unknown",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            MountStat3::Ok => "no error",
            MountStat3::Perm => "not owner",
            MountStat3::NoEnt => "no such file or directory",
            MountStat3::Io => "i/o error",
            MountStat3::Acces => "permission denied",
            MountStat3::NotDir => "not a directory",
            MountStat3::Inval => "invalid argument",
            MountStat3::NameTooLong => "filename too long",
            MountStat3::NotSupp => "operation not supported",
            MountStat3::ServerFault => "a failure on the server",
            MountStat3::Unknown(_) => "unknown mount status",
        }
    }
}

impl fmt::Display for MountStat3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name(), self.description(), self.code())
    }
}

impl<B: xdr::Packer> PackTo<B> for MountStat3 {
    fn pack_to(&self, buf: &mut B) {
        buf.pack_uint(self.code());
    }
}

impl<B: xdr::Unpacker> UnpackFrom<B> for MountStat3 {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        Ok(MountStat3::from_u32(buf.unpack_uint()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRes3Ok {
    /// fhandle3, at most [`FHSIZE3`] bytes
    pub handle: Bytes,
    pub auth_flavors: Vec<u32>,
}

impl<B: xdr::Packer> PackTo<B> for MountRes3Ok {
    fn pack_to(&self, buf: &mut B) {
        self.handle.pack_to(buf);
        self.auth_flavors.pack_to(buf);
    }
}

impl<B: xdr::Unpacker> UnpackFrom<B> for MountRes3Ok {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        let handle = buf.unpack_opaque()?;
        if handle.len() > FHSIZE3 {
            return Err(Error::decode(format!(
                "file handle of {} bytes exceeds {}",
                handle.len(),
                FHSIZE3
            )));
        }

        Ok(MountRes3Ok {
            handle,
            auth_flavors: Vec::<u32>::unpack_from(buf)?,
        })
    }
}

/// mountres3: the handle on success, otherwise the failure status.
/// Never `Err(MountStat3::Ok)`.
pub type MountResult = std::result::Result<MountRes3Ok, MountStat3>;

impl<B: xdr::Packer> PackTo<B> for MountResult {
    fn pack_to(&self, buf: &mut B) {
        match self {
            Ok(res_ok) => {
                MountStat3::Ok.pack_to(buf);
                res_ok.pack_to(buf);
            }
            Err(stat) => stat.pack_to(buf),
        }
    }
}

impl<B: xdr::Unpacker> UnpackFrom<B> for MountResult {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        match MountStat3::unpack_from(buf)? {
            MountStat3::Ok => Ok(Ok(MountRes3Ok::unpack_from(buf)?)),
            stat => Ok(Err(stat)),
        }
    }
}

/// The dirpath argument of MNT.  Besides plain paths the server accepts
/// commands introduced by `@`; a command argument runs up to the first
/// `/`, which starts the export path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountCommand<'a> {
    GetNonce,
    Otp { otp: &'a str, path: &'a str },
    Password { password: &'a str, path: &'a str },
    Path(&'a str),
}

impl MountCommand<'_> {
    /// Renders the dirpath, rejecting what the server would misparse
    pub fn dirpath(&self) -> Result<String> {
        let dirpath = match self {
            MountCommand::GetNonce => GET_NONCE.to_string(),
            MountCommand::Otp { otp, path } => {
                check_argument("otp", otp)?;
                check_path(path)?;
                format!("{}{}{}", OTP_PREFIX, otp, path)
            }
            MountCommand::Password { password, path } => {
                check_argument("password", password)?;
                check_path(path)?;
                format!("{}{}{}", PASSWORD_PREFIX, password, path)
            }
            MountCommand::Path(path) => {
                check_path(path)?;
                path.to_string()
            }
        };

        check_len(&dirpath)?;
        Ok(dirpath)
    }
}

fn check_argument(what: &str, arg: &str) -> Result<()> {
    if arg.contains('/') {
        return Err(Error::InvalidArgument(format!("{} must not contain '/'", what)));
    }
    if arg.len() > PASSWORD_MAXLEN {
        return Err(Error::InvalidArgument(format!(
            "{} of {} bytes exceeds {}",
            what,
            arg.len(),
            PASSWORD_MAXLEN
        )));
    }
    Ok(())
}

fn check_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidArgument(format!(
            "export path {:?} must be absolute",
            path
        )));
    }
    Ok(())
}

fn check_len(dirpath: &str) -> Result<()> {
    if dirpath.len() > MNTPATHLEN {
        return Err(Error::InvalidArgument(format!(
            "dirpath of {} bytes exceeds {}",
            dirpath.len(),
            MNTPATHLEN
        )));
    }
    Ok(())
}

/// Client for the MNT procedure of the MOUNT program
pub struct MountClient<S> {
    rpc: RpcClient<S>,
    protocol: MountProtocol,
}

impl MountClient<TcpStream> {
    pub async fn connect(host: &str, port: u16, config: ClientConfig) -> Result<Self> {
        Ok(MountClient::new(RpcClient::connect(host, port, config).await?))
    }
}

impl<S> MountClient<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn from_transport(transport: Transport<S>, config: ClientConfig) -> Self {
        MountClient::new(RpcClient::new(transport, config))
    }
}

impl<S> MountClient<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Uses the program numbers from the client configuration
    pub fn new(rpc: RpcClient<S>) -> Self {
        let protocol = rpc.config().mount;
        MountClient { rpc, protocol }
    }

    /// Calls MNT with `path` as is.  A non-OK status is returned in the
    /// `MountResult`, it is up to the caller to interpret it.
    pub async fn mount(&self, path: &str) -> Result<MountResult> {
        check_len(path)?;
        let res = self
            .rpc
            .call(
                self.protocol.program,
                self.protocol.version,
                self.protocol.mnt,
                &path,
                |buf| MountResult::unpack_from(buf),
            )
            .await?;

        match &res {
            Ok(res_ok) => debug!(handle_len = res_ok.handle.len(), "mounted"),
            Err(stat) => debug!(%stat, "mount refused"),
        }
        Ok(res)
    }

    pub async fn mount_command(&self, command: &MountCommand<'_>) -> Result<MountResult> {
        let dirpath = command.dirpath()?;
        self.mount(&dirpath).await
    }

    pub async fn close(&self) -> Result<()> {
        self.rpc.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::AcceptedReplyStat;
    use crate::testing::{self, accepted, success};
    use crate::xdr::Unpacker as _;
    use bytes::{Buf, BytesMut};

    fn handle_result(handle: &'static [u8]) -> MountResult {
        Ok(MountRes3Ok {
            handle: Bytes::from_static(handle),
            auth_flavors: vec![1],
        })
    }

    #[test]
    fn test_mount_result_round_trip() {
        for res in [
            handle_result(b"0123456789abcdef0123456789abcdef"),
            Err(MountStat3::Acces),
            Err(MountStat3::Unknown(7)),
        ] {
            let mut buf = BytesMut::new();
            res.pack_to(&mut buf);
            let mut buf = buf.freeze();
            assert_eq!(MountResult::unpack_from(&mut buf).unwrap(), res);
            assert!(!buf.has_remaining());
        }
    }

    #[test]
    fn test_mount_result_layout() {
        let mut buf = BytesMut::new();
        handle_result(b"ABCDE").pack_to(&mut buf);
        assert_eq!(
            buf.as_ref(),
            b"\0\0\0\0\0\0\0\x05ABCDE\0\0\0\0\0\0\x01\0\0\0\x01".as_ref()
        );
    }

    #[test]
    fn test_handle_too_long() {
        let mut buf = BytesMut::new();
        MountStat3::Ok.pack_to(&mut buf);
        Bytes::from(vec![0u8; FHSIZE3 + 1]).pack_to(&mut buf);
        Vec::<u32>::new().pack_to(&mut buf);
        let mut buf = buf.freeze();
        assert!(matches!(
            MountResult::unpack_from(&mut buf),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_status_codes() {
        for code in [0, 1, 2, 5, 13, 20, 22, 63, 10004, 10006, 4242] {
            assert_eq!(MountStat3::from_u32(code).code(), code);
        }
        assert_eq!(MountStat3::from_u32(13), MountStat3::Acces);
        assert!(MountStat3::NoEnt.to_string().contains("MNT3ERR_NOENT"));
    }

    #[test]
    fn test_dirpath() {
        assert_eq!(MountCommand::GetNonce.dirpath().unwrap(), "@getnonce");
        assert_eq!(
            MountCommand::Otp {
                otp: "0cc175b9c0f1b6a831c399e269772661",
                path: "/export/home"
            }
            .dirpath()
            .unwrap(),
            "@otp:0cc175b9c0f1b6a831c399e269772661/export/home"
        );
        assert_eq!(
            MountCommand::Password {
                password: "hunter2",
                path: "/srv"
            }
            .dirpath()
            .unwrap(),
            "@password:hunter2/srv"
        );
        assert_eq!(MountCommand::Path("/srv").dirpath().unwrap(), "/srv");
    }

    #[test]
    fn test_dirpath_rejects() {
        let bad = [
            MountCommand::Password {
                password: "a/b",
                path: "/srv",
            },
            MountCommand::Otp {
                otp: "abc",
                path: "srv",
            },
            MountCommand::Path("relative"),
        ];
        for cmd in bad {
            assert!(matches!(cmd.dirpath(), Err(Error::InvalidArgument(_))));
        }

        let password = "p".repeat(PASSWORD_MAXLEN);
        assert!(MountCommand::Password {
            password: &password,
            path: "/srv",
        }
        .dirpath()
        .is_ok());
        let password = "p".repeat(PASSWORD_MAXLEN + 1);
        assert!(matches!(
            MountCommand::Password {
                password: &password,
                path: "/srv",
            }
            .dirpath(),
            Err(Error::InvalidArgument(_))
        ));

        let long = format!("/{}", "x".repeat(MNTPATHLEN));
        assert!(matches!(
            MountCommand::Path(&long).dirpath(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_mount_call() {
        let (rpc, server) = testing::client_pair(ClientConfig::default());
        testing::spawn_server(server, |call, mut args| {
            assert_eq!((call.prog, call.vers, call.proc), (100005, 3, 1));
            assert_eq!(args.unpack_string().unwrap(), "/export");
            vec![success(call.xid, |buf| {
                handle_result(b"fh-bytes").pack_to(buf)
            })]
        });

        let client = MountClient::new(rpc);
        let res = client.mount("/export").await.unwrap();
        assert_eq!(res, handle_result(b"fh-bytes"));
    }

    #[tokio::test]
    async fn test_mount_status_is_not_an_error() {
        let (rpc, server) = testing::client_pair(ClientConfig::default());
        testing::spawn_server(server, |call, _| {
            vec![success(call.xid, |buf| {
                MountResult::Err(MountStat3::NoEnt).pack_to(buf)
            })]
        });

        let client = MountClient::new(rpc);
        assert_eq!(client.mount("/nope").await.unwrap(), Err(MountStat3::NoEnt));
    }

    #[tokio::test]
    async fn test_injected_protocol_numbers() {
        let config = ClientConfig {
            mount: MountProtocol {
                program: 400005,
                version: 1,
                mnt: 9,
            },
            ..Default::default()
        };
        let (rpc, server) = testing::client_pair(config);
        testing::spawn_server(server, |call, _| {
            assert_eq!((call.prog, call.vers, call.proc), (400005, 1, 9));
            vec![testing::reply(&accepted(call.xid, AcceptedReplyStat::ProgUnavail))]
        });

        let client = MountClient::new(rpc);
        assert!(matches!(
            client.mount("/x").await,
            Err(Error::RpcProcedure(AcceptedReplyStat::ProgUnavail))
        ));
    }
}
