use crate::{
    config::ClientConfig,
    record,
    result::{Error, Result},
    transport::Transport,
    xdr::{self, PackTo, Packer as _, UnpackFrom, Unpacker as _},
};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{
    atomic::{self, AtomicU32},
    Arc, Mutex, MutexGuard,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// RFC5531  RPC v2

pub const RPC_VERSION: u32 = 2;

const CALL: u32 = 0;
const REPLY: u32 = 1;

pub const AUTH_NONE: u32 = 0;
pub const AUTH_SYS: u32 = 1;

const MSG_ACCEPTED: u32 = 0;
const MSG_DENIED: u32 = 1;

/// Upper bound on the body of an opaque_auth
const MAX_AUTH_BYTES: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSys {
    pub stamp: u32,
    pub machine_name: Bytes,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

/// RFC5531 opaque_auth
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OpaqueAuth {
    #[default]
    None,
    Sys(AuthSys),
    /// A flavor this client does not interpret, kept as raw bytes
    Other { flavor: u32, body: Bytes },
}

impl<B: Packer> PackTo<B> for OpaqueAuth {
    fn pack_to(&self, buf: &mut B) {
        buf.pack_auth(self);
    }
}

impl<B: Unpacker> UnpackFrom<B> for OpaqueAuth {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        buf.unpack_auth()
    }
}

/// Corresponds to RFC5531 rpc_msg with a call_body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: u32,
    // rpcvers is hardcoded 2
    pub prog: u32,
    pub vers: u32,
    pub proc: u32,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth,
}

impl<B: Packer> PackTo<B> for CallHeader {
    #[inline]
    fn pack_to(&self, buf: &mut B) {
        buf.pack_call_header(self);
    }
}

impl<B: Unpacker> UnpackFrom<B> for CallHeader {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        buf.unpack_call_header()
    }
}

/// Corresponds to RFC5531 rpc_msg with a reply_body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: u32,
    pub body: ReplyBody,
}

impl<B: Packer> PackTo<B> for ReplyHeader {
    fn pack_to(&self, buf: &mut B) {
        buf.pack_uint(self.xid);
        buf.pack_uint(REPLY);
        self.body.pack_to(buf);
    }
}

impl<B: Unpacker> UnpackFrom<B> for ReplyHeader {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        let xid = buf.unpack_uint()?;
        let msg_type = buf.unpack_uint()?;
        if msg_type != REPLY {
            return Err(Error::decode(format!("expected REPLY, got {}", msg_type)));
        }

        Ok(ReplyHeader {
            xid,
            body: ReplyBody::unpack_from(buf)?,
        })
    }
}

/// Corresponds to RFC5531 reply_body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Accepted(AcceptedReply),
    Denied(RejectedReply),
}

impl<B: Packer> PackTo<B> for ReplyBody {
    fn pack_to(&self, buf: &mut B) {
        match self {
            ReplyBody::Accepted(accepted) => {
                buf.pack_uint(MSG_ACCEPTED);
                accepted.verf.pack_to(buf);
                accepted.stat.pack_to(buf);
            }
            ReplyBody::Denied(rejected) => {
                buf.pack_uint(MSG_DENIED);
                rejected.pack_to(buf);
            }
        }
    }
}

impl<B: Unpacker> UnpackFrom<B> for ReplyBody {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        buf.unpack_reply_body()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedReply {
    pub verf: OpaqueAuth,
    pub stat: AcceptedReplyStat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptedReplyStat {
    Success,
    ProgUnavail,
    ProgMismatch(MismatchInfo),
    ProcUnavail,
    GarbageArgs,
    SystemErr,
}

impl<B: xdr::Packer> PackTo<B> for AcceptedReplyStat {
    fn pack_to(&self, buf: &mut B) {
        match self {
            AcceptedReplyStat::Success => buf.pack_uint(0),
            AcceptedReplyStat::ProgUnavail => buf.pack_uint(1),
            AcceptedReplyStat::ProgMismatch(info) => {
                buf.pack_uint(2);
                info.pack_to(buf);
            }
            AcceptedReplyStat::ProcUnavail => buf.pack_uint(3),
            AcceptedReplyStat::GarbageArgs => buf.pack_uint(4),
            AcceptedReplyStat::SystemErr => buf.pack_uint(5),
        }
    }
}

impl<B: xdr::Unpacker> UnpackFrom<B> for AcceptedReplyStat {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        Ok(match buf.unpack_uint()? {
            0 => AcceptedReplyStat::Success,
            1 => AcceptedReplyStat::ProgUnavail,
            2 => AcceptedReplyStat::ProgMismatch(MismatchInfo::unpack_from(buf)?),
            3 => AcceptedReplyStat::ProcUnavail,
            4 => AcceptedReplyStat::GarbageArgs,
            5 => AcceptedReplyStat::SystemErr,
            n => return Err(Error::decode(format!("invalid accept_stat {}", n))),
        })
    }
}

impl fmt::Display for AcceptedReplyStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptedReplyStat::Success => write!(f, "success"),
            AcceptedReplyStat::ProgUnavail => write!(f, "program unavailable"),
            AcceptedReplyStat::ProgMismatch(info) => {
                write!(f, "program version mismatch (supported {})", info)
            }
            AcceptedReplyStat::ProcUnavail => write!(f, "procedure unavailable"),
            AcceptedReplyStat::GarbageArgs => write!(f, "garbage arguments"),
            AcceptedReplyStat::SystemErr => write!(f, "system error"),
        }
    }
}

/// Lowest and highest version supported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MismatchInfo {
    pub low: u32,
    pub high: u32,
}

impl<B: xdr::Packer> PackTo<B> for MismatchInfo {
    fn pack_to(&self, buf: &mut B) {
        buf.pack_uint(self.low);
        buf.pack_uint(self.high);
    }
}

impl<B: xdr::Unpacker> UnpackFrom<B> for MismatchInfo {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        Ok(MismatchInfo {
            low: buf.unpack_uint()?,
            high: buf.unpack_uint()?,
        })
    }
}

impl fmt::Display for MismatchInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.low, self.high)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthStat {
    Ok = 0,
    BadCred = 1,
    RejectedCred = 2,
    BadVerf = 3,
    RejectedVerf = 4,
    TooWeak = 5,
    InvalidResp = 6,
    Failed = 7,
    KerbGeneric = 8,
    TimeExpire = 9,
    TktFile = 10,
    Decode = 11,
    NetAddr = 12,
    CredProblem = 13,
    CtxProblem = 14,
}

impl AuthStat {
    const ALL: [AuthStat; 15] = [
        AuthStat::Ok,
        AuthStat::BadCred,
        AuthStat::RejectedCred,
        AuthStat::BadVerf,
        AuthStat::RejectedVerf,
        AuthStat::TooWeak,
        AuthStat::InvalidResp,
        AuthStat::Failed,
        AuthStat::KerbGeneric,
        AuthStat::TimeExpire,
        AuthStat::TktFile,
        AuthStat::Decode,
        AuthStat::NetAddr,
        AuthStat::CredProblem,
        AuthStat::CtxProblem,
    ];

    pub fn from_u32(n: u32) -> Option<AuthStat> {
        Self::ALL.get(n as usize).copied()
    }

    pub fn description(&self) -> &'static str {
        match self {
            AuthStat::Ok => "success",
            AuthStat::BadCred => "bad credential (seal broken)",
            AuthStat::RejectedCred => "client must begin new session",
            AuthStat::BadVerf => "bad verifier (seal broken)",
            AuthStat::RejectedVerf => "verifier expired or replayed",
            AuthStat::TooWeak => "rejected for security reasons",
            AuthStat::InvalidResp => "bogus response verifier",
            AuthStat::Failed => "reason unknown",
            AuthStat::KerbGeneric => "kerberos generic error",
            AuthStat::TimeExpire => "credential expired",
            AuthStat::TktFile => "problem with ticket file",
            AuthStat::Decode => "can't decode authenticator",
            AuthStat::NetAddr => "wrong net address in ticket",
            AuthStat::CredProblem => "no credentials for user",
            AuthStat::CtxProblem => "problem with context",
        }
    }
}

impl fmt::Display for AuthStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectedReply {
    RpcMismatch(MismatchInfo),
    AuthError(AuthStat),
}

impl<B: xdr::Packer> PackTo<B> for RejectedReply {
    fn pack_to(&self, buf: &mut B) {
        match self {
            RejectedReply::RpcMismatch(info) => {
                buf.pack_uint(0);
                info.pack_to(buf);
            }
            RejectedReply::AuthError(stat) => {
                buf.pack_uint(1);
                buf.pack_uint(*stat as u32);
            }
        }
    }
}

impl<B: xdr::Unpacker> UnpackFrom<B> for RejectedReply {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        match buf.unpack_uint()? {
            0 => Ok(RejectedReply::RpcMismatch(MismatchInfo::unpack_from(buf)?)),
            1 => {
                let n = buf.unpack_uint()?;
                AuthStat::from_u32(n)
                    .map(RejectedReply::AuthError)
                    .ok_or_else(|| Error::decode(format!("invalid auth_stat {}", n)))
            }
            n => Err(Error::decode(format!("invalid reject_stat {}", n))),
        }
    }
}

impl fmt::Display for RejectedReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectedReply::RpcMismatch(info) => {
                write!(f, "rpc version mismatch (supported {})", info)
            }
            RejectedReply::AuthError(stat) => write!(f, "authentication error: {}", stat),
        }
    }
}

/// Trait for packing RPC header
pub trait Packer: xdr::Packer {
    fn pack_call_header(&mut self, header: &CallHeader);
    fn pack_auth(&mut self, auth: &OpaqueAuth);
    fn pack_auth_sys(&mut self, auth: &AuthSys);
}

/// Trait for unpacking RPC header
pub trait Unpacker: xdr::Unpacker {
    fn unpack_call_header(&mut self) -> Result<CallHeader>;
    fn unpack_reply_body(&mut self) -> Result<ReplyBody>;
    fn unpack_auth(&mut self) -> Result<OpaqueAuth>;
}

impl<T: xdr::Packer> Packer for T {
    fn pack_call_header(&mut self, header: &CallHeader) {
        self.pack_uint(header.xid);
        self.pack_uint(CALL);
        self.pack_uint(RPC_VERSION);
        self.pack_uint(header.prog);
        self.pack_uint(header.vers);
        self.pack_uint(header.proc);
        self.pack_auth(&header.cred);
        self.pack_auth(&header.verf);
    }

    fn pack_auth(&mut self, auth: &OpaqueAuth) {
        match auth {
            OpaqueAuth::None => {
                self.pack_uint(AUTH_NONE);
                self.pack_uint(0)
            }
            OpaqueAuth::Sys(auth_sys) => {
                self.pack_uint(AUTH_SYS);
                self.pack_auth_sys(auth_sys)
            }
            OpaqueAuth::Other { flavor, body } => {
                self.pack_uint(*flavor);
                self.pack_opaque(body)
            }
        }
    }

    fn pack_auth_sys(&mut self, auth: &AuthSys) {
        let mut body = BytesMut::new();
        body.pack_uint(auth.stamp);
        body.pack_opaque(&auth.machine_name);
        body.pack_uint(auth.uid);
        body.pack_uint(auth.gid);
        body.pack_array(&auth.gids, |packer, item| packer.pack_uint(*item));
        self.pack_opaque(&body);
    }
}

impl<T: xdr::Unpacker> Unpacker for T {
    fn unpack_call_header(&mut self) -> Result<CallHeader> {
        let xid = self.unpack_uint()?;
        let msg_type = self.unpack_uint()?;
        if msg_type != CALL {
            return Err(Error::decode(format!("expected CALL, got {}", msg_type)));
        }
        let rpcvers = self.unpack_uint()?;
        if rpcvers != RPC_VERSION {
            return Err(Error::decode(format!("unsupported rpc version {}", rpcvers)));
        }

        Ok(CallHeader {
            xid,
            prog: self.unpack_uint()?,
            vers: self.unpack_uint()?,
            proc: self.unpack_uint()?,
            cred: self.unpack_auth()?,
            verf: self.unpack_auth()?,
        })
    }

    fn unpack_reply_body(&mut self) -> Result<ReplyBody> {
        match self.unpack_uint()? {
            MSG_ACCEPTED => Ok(ReplyBody::Accepted(AcceptedReply {
                verf: self.unpack_auth()?,
                stat: AcceptedReplyStat::unpack_from(self)?,
            })),
            MSG_DENIED => Ok(ReplyBody::Denied(RejectedReply::unpack_from(self)?)),
            n => Err(Error::decode(format!("invalid reply_stat {}", n))),
        }
    }

    fn unpack_auth(&mut self) -> Result<OpaqueAuth> {
        let flavor = self.unpack_uint()?;
        let mut body = self.unpack_opaque()?;
        if body.len() > MAX_AUTH_BYTES {
            return Err(Error::decode(format!(
                "auth body of {} bytes exceeds {}",
                body.len(),
                MAX_AUTH_BYTES
            )));
        }

        match flavor {
            // The body of AUTH_NONE is undefined, though recommended empty
            AUTH_NONE => Ok(OpaqueAuth::None),
            AUTH_SYS => Ok(OpaqueAuth::Sys(AuthSys {
                stamp: body.unpack_uint()?,
                machine_name: body.unpack_opaque()?,
                uid: body.unpack_uint()?,
                gid: body.unpack_uint()?,
                gids: body.unpack_vec(|unpacker| unpacker.unpack_uint())?,
            })),
            flavor => Ok(OpaqueAuth::Other { flavor, body }),
        }
    }
}

impl OpaqueAuth {
    pub fn new_none() -> OpaqueAuth {
        OpaqueAuth::None
    }

    pub fn new_sys(
        stamp: u32,
        machine_name: Bytes,
        uid: u32,
        gid: u32,
        gids: Vec<u32>,
    ) -> OpaqueAuth {
        OpaqueAuth::Sys(AuthSys {
            stamp,
            machine_name,
            uid,
            gid,
            gids,
        })
    }
}

/// Turns the reply body into the caller-visible outcome: `Ok` only for
/// an accepted call that ran successfully.
pub fn check_reply(body: ReplyBody) -> Result<()> {
    match body {
        ReplyBody::Accepted(AcceptedReply { stat, .. }) => match stat {
            AcceptedReplyStat::Success => Ok(()),
            stat => Err(Error::RpcProcedure(stat)),
        },
        ReplyBody::Denied(rejected) => Err(Error::RpcAuth(rejected)),
    }
}

/// Why the connection stopped delivering replies
#[derive(Debug, Clone, PartialEq, Eq)]
enum Closed {
    Io(std::io::ErrorKind),
    /// Malformed record marking from the server
    Protocol(String),
}

impl Closed {
    fn from_error(err: &Error) -> Closed {
        match err {
            Error::Protocol(msg) => Closed::Protocol(msg.clone()),
            Error::Io(err) => Closed::Io(err.kind()),
            _ => Closed::Io(std::io::ErrorKind::UnexpectedEof),
        }
    }

    fn error(&self) -> Error {
        match self {
            Closed::Io(kind) => Error::closed(*kind),
            Closed::Protocol(msg) => Error::protocol(msg.clone()),
        }
    }
}

/// Calls waiting for their reply, keyed by xid
#[derive(Default)]
struct PendingCalls {
    calls: BTreeMap<u32, oneshot::Sender<Bytes>>,
    /// Set once the receiver stops, no new call can be answered after that
    closed: Option<Closed>,
}

type Pending = Arc<Mutex<PendingCalls>>;

fn lock(pending: &Pending) -> MutexGuard<'_, PendingCalls> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drops every waiting sender, which fails the calls still waiting.
/// The first reason recorded is the one every call reports.
fn close_pending(pending: &Pending, reason: Closed) {
    let mut pending = lock(pending);
    if pending.closed.is_none() {
        pending.closed = Some(reason);
    }
    pending.calls.clear();
}

fn closed_error(pending: &Pending) -> Error {
    lock(pending)
        .closed
        .as_ref()
        .map(Closed::error)
        .unwrap_or_else(|| Error::closed(std::io::ErrorKind::UnexpectedEof))
}

struct RpcClientReceiver<S> {
    connection: Transport<ReadHalf<S>>,
    pending: Pending,
    max_size: u32,
}

impl<S: AsyncRead> RpcClientReceiver<S> {
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let mut buf = record::read_record(&mut self.connection, self.max_size).await?;
            if buf.remaining() < 8 {
                warn!(len = buf.remaining(), "bad packet -- too short");
                continue;
            }

            let xid = buf.get_u32();
            let msg_type = buf.get_u32();
            match msg_type {
                CALL => debug!(xid, "ignoring callback"),
                REPLY => {
                    let tx = lock(&self.pending).calls.remove(&xid);
                    match tx {
                        None => debug!(xid, "discarding reply with unmatched xid"),
                        Some(tx) => {
                            // The caller may have timed out in the meantime
                            let _ = tx.send(buf);
                        }
                    }
                }
                _ => warn!(xid, msg_type, "corrupt packet"),
            }
        }
    }
}

/// A client for one RPC connection.
///
/// Calls are correlated with their replies by xid, so several calls may
/// share the connection; replies nobody waits for are dropped.
pub struct RpcClient<S> {
    connection: tokio::sync::Mutex<Transport<WriteHalf<S>>>,
    pending: Pending,
    receiver: JoinHandle<()>,
    config: ClientConfig,
}

impl RpcClient<TcpStream> {
    /// Connects to `host:port` over TCP
    pub async fn connect(host: &str, port: u16, config: ClientConfig) -> Result<Self> {
        let transport = Transport::open(host, port).await?;
        Ok(RpcClient::new(transport, config))
    }
}

impl<S> RpcClient<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(transport: Transport<S>, config: ClientConfig) -> RpcClient<S> {
        let (read, write) = transport.split();
        let pending: Pending = Arc::new(Mutex::new(PendingCalls::default()));

        let mut reader = RpcClientReceiver {
            connection: read,
            pending: pending.clone(),
            max_size: config.max_record_size,
        };

        let receiver = tokio::spawn(async move {
            let reason = match reader.run().await {
                Err(err) => {
                    let reason = Closed::from_error(&err);
                    if reason == Closed::Io(std::io::ErrorKind::UnexpectedEof) {
                        debug!(peer = reader.connection.peer(), "connection closed by peer")
                    } else {
                        warn!(peer = reader.connection.peer(), %err, "receiver stopped")
                    }
                    reason
                }
                Ok(()) => Closed::Io(std::io::ErrorKind::UnexpectedEof),
            };
            close_pending(&reader.pending, reason);
        });

        RpcClient {
            connection: tokio::sync::Mutex::new(write),
            pending,
            receiver,
            config,
        }
    }
}

impl<S> RpcClient<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Returns a new xid (RPC transaction ID).
    ///
    /// According to the RFC:
    /// "The "xid" field is only used for clients matching reply
    /// messages with call messages or for servers detecting
    /// retransmissions; the service side cannot treat this id as any
    /// type of sequence number."
    pub fn next_xid() -> u32 {
        static XID: AtomicU32 = AtomicU32::new(0x58494430);
        XID.fetch_add(1, atomic::Ordering::Relaxed)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Calls procedure `proc` of program `prog` version `vers` with
    /// `args`, and decodes the result with `unpack`.
    ///
    /// Waits at most the configured timeout for the reply.  Nothing is
    /// retried: transport failures, denied or unsuccessful replies and
    /// timeouts are all returned to the caller.
    pub async fn call<A, R, F>(&self, prog: u32, vers: u32, proc: u32, args: &A, unpack: F) -> Result<R>
    where
        A: PackTo<BytesMut>,
        F: FnOnce(&mut Bytes) -> Result<R>,
    {
        let xid = Self::next_xid();
        let header = CallHeader {
            xid,
            prog,
            vers,
            proc,
            cred: self.config.credential.clone(),
            verf: OpaqueAuth::new_none(),
        };

        let mut buf = record::new_buf();
        header.pack_to(&mut buf);
        args.pack_to(&mut buf);

        let rx = {
            let mut pending = lock(&self.pending);
            if let Some(reason) = &pending.closed {
                return Err(reason.error());
            }
            let (tx, rx) = oneshot::channel();
            pending.calls.insert(xid, tx);
            rx
        };

        debug!(xid, prog, vers, proc, "call");
        if let Err(err) = self.send(buf).await {
            lock(&self.pending).calls.remove(&xid);
            return Err(err);
        }

        let mut reply = match tokio::time::timeout(self.config.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(closed_error(&self.pending)),
            Err(_) => {
                lock(&self.pending).calls.remove(&xid);
                return Err(Error::Timeout {
                    xid,
                    timeout_ms: self.config.timeout.as_millis(),
                });
            }
        };

        check_reply(ReplyBody::unpack_from(&mut reply)?)?;
        unpack(&mut reply)
    }

    async fn send(&self, buf: BytesMut) -> Result<()> {
        let mut connection = self.connection.lock().await;
        record::write_record(&mut *connection, buf).await
    }

    /// Closes the connection.  Calls still waiting fail with an i/o
    /// error, as does any later call.
    pub async fn close(&self) -> Result<()> {
        close_pending(&self.pending, Closed::Io(std::io::ErrorKind::UnexpectedEof));
        self.receiver.abort();
        self.connection.lock().await.close().await
    }
}

impl<S> Drop for RpcClient<S> {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}
