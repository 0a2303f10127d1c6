//! Minimal byte-level encoder for `NETLINK_NETFILTER` / nftables messages.
//!
//! There's no nftables binding crate anywhere in this workspace's dependency
//! tree, so rule materialization is built directly on the same raw
//! netlink-socket idiom used for `NETLINK_ROUTE` elsewhere in this
//! workspace (see `meshguard_control::link`): hand-assembled `nlmsghdr` +
//! `nfgenmsg` + nested attributes, sent over a plain `netlink_sys::Socket`.

use std::io;

use netlink_sys::{protocols::NETLINK_NETFILTER, Socket, SocketAddr};

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

pub const NFNL_SUBSYS_NFTABLES: u8 = 10;

// nft message subtypes, from `linux/netfilter/nf_tables.h`.
pub const NFT_MSG_NEWTABLE: u16 = 0;
pub const NFT_MSG_NEWCHAIN: u16 = 3;
pub const NFT_MSG_NEWRULE: u16 = 6;
pub const NFT_MSG_DELTABLE: u16 = 1;

// Batch framing, from `linux/netfilter/nfnetlink.h`. These use the reserved
// message type range below `NLMSG_MIN_TYPE`, so they aren't namespaced under
// a subsystem the way table/chain/rule messages are.
pub const NFNL_MSG_BATCH_BEGIN: u16 = 0x10;
pub const NFNL_MSG_BATCH_END: u16 = 0x11;
pub const NFNL_SUBSYS_NONE: u8 = 0;

const NLA_F_NESTED: u16 = 1 << 15;

pub const NFPROTO_INET: u8 = 1;

/// Builds the nested-attribute payload of a single nftables netlink message
/// (everything after the `nfgenmsg` header).
#[derive(Default)]
pub struct AttrWriter {
    buf: Vec<u8>,
}

impl AttrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn pad(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }

    /// Appends a raw attribute, padding the previous attribute to a 4 byte
    /// boundary first.
    pub fn push(&mut self, kind: u16, value: &[u8]) -> &mut Self {
        self.pad();
        let len = (4 + value.len()) as u16;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    pub fn push_str_nul(&mut self, kind: u16, value: &str) -> &mut Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.push(kind, &bytes)
    }

    pub fn push_u32_be(&mut self, kind: u16, value: u32) -> &mut Self {
        self.push(kind, &value.to_be_bytes())
    }

    pub fn push_u8(&mut self, kind: u16, value: u8) -> &mut Self {
        self.push(kind, &[value])
    }

    /// Starts a nested attribute, returning the offset of its length field
    /// so [`Self::nest_end`] can patch it in afterward.
    pub fn nest_start(&mut self, kind: u16) -> usize {
        self.pad();
        let offset = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf
            .extend_from_slice(&(kind | NLA_F_NESTED).to_ne_bytes());
        offset
    }

    pub fn nest_end(&mut self, offset: usize) {
        self.pad();
        let len = (self.buf.len() - offset) as u16;
        self.buf[offset..offset + 2].copy_from_slice(&len.to_ne_bytes());
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.pad();
        self.buf
    }
}

/// One nftables request: a subsystem message type plus its pre-encoded
/// `nfgenmsg` + attribute body.
pub struct NftMessage {
    pub msg_type: u16,
    pub body: Vec<u8>,
    /// When set, a nonzero error ack for this message is swallowed instead
    /// of failing the whole batch - used for the leading table flush, which
    /// is expected to fail with `ENOENT` the first time a table is built.
    pub ignore_errors: bool,
}

impl NftMessage {
    pub fn new(subsys_msg: u16, family: u8, body: AttrWriter) -> Self {
        let mut payload = Vec::with_capacity(4 + body.buf.len());
        payload.push(family);
        payload.push(0); // version
        payload.extend_from_slice(&0u16.to_ne_bytes()); // res_id, kernel-assigned
        payload.extend_from_slice(&body.into_bytes());
        NftMessage {
            msg_type: ((NFNL_SUBSYS_NFTABLES as u16) << 8) | subsys_msg,
            body: payload,
            ignore_errors: false,
        }
    }
}

const NLM_F_REQUEST: u16 = 1;
const NLM_F_ACK: u16 = 4;
const NLM_F_CREATE: u16 = 0x400;

fn encode_nlmsg(msg_type: u16, flags: u16, seq: u32, body: &[u8]) -> Vec<u8> {
    let total_len = 16 + body.len();
    let mut buf = Vec::with_capacity(total_len + 4);
    buf.extend_from_slice(&(total_len as u32).to_ne_bytes());
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // pid
    buf.extend_from_slice(body);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
    buf
}

/// Sends a batch of nftables messages as a single atomic transaction,
/// wrapped in `NFNL_MSG_BATCH_BEGIN`/`END` the way `nft`'s own batching does,
/// and waits for an ack (or error) on each.
pub fn commit_batch(messages: Vec<NftMessage>) -> io::Result<()> {
    let mut buf = Vec::new();
    let mut seq = 1u32;

    let mut begin_body = Vec::with_capacity(4);
    begin_body.push(NFPROTO_INET);
    begin_body.push(0);
    begin_body.extend_from_slice(&0u16.to_ne_bytes());
    buf.extend_from_slice(&encode_nlmsg(
        ((NFNL_SUBSYS_NONE as u16) << 8) | NFNL_MSG_BATCH_BEGIN,
        NLM_F_REQUEST,
        seq,
        &begin_body,
    ));
    seq += 1;

    for message in &messages {
        buf.extend_from_slice(&encode_nlmsg(
            message.msg_type,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE,
            seq,
            &message.body,
        ));
        seq += 1;
    }

    let mut end_body = Vec::with_capacity(4);
    end_body.push(NFPROTO_INET);
    end_body.push(0);
    end_body.extend_from_slice(&0u16.to_ne_bytes());
    buf.extend_from_slice(&encode_nlmsg(
        ((NFNL_SUBSYS_NONE as u16) << 8) | NFNL_MSG_BATCH_END,
        NLM_F_REQUEST,
        seq,
        &end_body,
    ));

    let socket = Socket::new(NETLINK_NETFILTER)?;
    let kernel_addr = SocketAddr::new(0, 0);
    socket.connect(&kernel_addr)?;
    let n_sent = socket.send(&buf, 0)?;
    if n_sent != buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "failed to send full nftables batch",
        ));
    }

    // Drain acks/errors for every message in the batch. Each `NLM_F_ACK`
    // request gets back either an `NLMSG_ERROR` with a zero error code (ack)
    // or a nonzero one (failure), parsed directly off the wire since there's
    // no typed nftables payload to deserialize into.
    let mut recv_buf = [0u8; 8192];
    let mut remaining_acks = messages.len();
    // Acks come back in request order, one `NLMSG_ERROR` per message sent
    // with `NLM_F_ACK` - which is every message here - so this index lines
    // up each ack with the request that produced it.
    let mut message_index = 0usize;
    while remaining_acks > 0 {
        let n = socket.recv(&mut &mut recv_buf[..], 0)?;
        let mut offset = 0;
        while offset + 16 <= n {
            let len = u32::from_ne_bytes(recv_buf[offset..offset + 4].try_into().unwrap()) as usize;
            let msg_type = u16::from_ne_bytes(recv_buf[offset + 4..offset + 6].try_into().unwrap());
            if len < 16 || offset + len > n {
                break;
            }
            if msg_type == NLMSG_ERROR {
                let err_off = offset + 16;
                let code = i32::from_ne_bytes(recv_buf[err_off..err_off + 4].try_into().unwrap());
                if code != 0 {
                    let ignore = messages.get(message_index).is_some_and(|m| m.ignore_errors);
                    if !ignore {
                        return Err(io::Error::from_raw_os_error(-code));
                    }
                }
                message_index += 1;
                remaining_acks -= 1;
            } else if msg_type == NLMSG_DONE {
                remaining_acks = remaining_acks.saturating_sub(1);
            }
            offset += len;
            // nlmsg records are padded to 4 byte alignment.
            offset = (offset + 3) & !3;
        }
    }
    Ok(())
}
