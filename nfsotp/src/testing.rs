//! Scripted in-memory RPC server for unit tests
use crate::{
    config::ClientConfig,
    record,
    rpc::{
        AcceptedReply, AcceptedReplyStat, CallHeader, OpaqueAuth, RejectedReply, ReplyBody,
        ReplyHeader, RpcClient,
    },
    transport::Transport,
    xdr::{PackTo, UnpackFrom},
};
use bytes::{Bytes, BytesMut};
use tokio::io::{self, DuplexStream};
use tokio::task::JoinHandle;

/// A client connected to the returned stream, to be served by
/// [`spawn_server`]
pub(crate) fn client_pair(config: ClientConfig) -> (RpcClient<DuplexStream>, DuplexStream) {
    let (client, server) = io::duplex(64 * 1024);
    let client = RpcClient::new(Transport::from_stream(client, "fake-server"), config);
    (client, server)
}

/// Serves calls on `stream` until the client goes away.  `handler` gets
/// the decoded call header and the raw arguments, and returns the reply
/// messages to send back, possibly none.
pub(crate) fn spawn_server<F>(stream: DuplexStream, mut handler: F) -> JoinHandle<()>
where
    F: FnMut(CallHeader, Bytes) -> Vec<BytesMut> + Send + 'static,
{
    tokio::spawn(async move {
        let (mut read, mut write) = Transport::from_stream(stream, "client").split();
        while let Ok(mut msg) = record::read_record(&mut read, 1024 * 1024).await {
            let call = CallHeader::unpack_from(&mut msg).expect("valid call header");
            for reply in handler(call, msg) {
                if write.send(&frame(reply)).await.is_err() {
                    return;
                }
            }
        }
    })
}

fn frame(msg: BytesMut) -> Bytes {
    let mut buf = record::new_buf();
    buf.extend_from_slice(&msg);
    record::finalize(buf).expect("non-empty reply")
}

/// A message holding `header`
pub(crate) fn reply(header: &ReplyHeader) -> BytesMut {
    let mut buf = BytesMut::new();
    header.pack_to(&mut buf);
    buf
}

pub(crate) fn accepted(xid: u32, stat: AcceptedReplyStat) -> ReplyHeader {
    ReplyHeader {
        xid,
        body: ReplyBody::Accepted(AcceptedReply {
            verf: OpaqueAuth::None,
            stat,
        }),
    }
}

pub(crate) fn denied(xid: u32, rejected: RejectedReply) -> ReplyHeader {
    ReplyHeader {
        xid,
        body: ReplyBody::Denied(rejected),
    }
}

/// A successful reply whose results are written by `results`
pub(crate) fn success<F: FnOnce(&mut BytesMut)>(xid: u32, results: F) -> BytesMut {
    let mut buf = reply(&accepted(xid, AcceptedReplyStat::Success));
    results(&mut buf);
    buf
}
