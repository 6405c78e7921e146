//! TCP reference plugin.
//!
//! A self-contained backend over nonblocking TCP sockets, intended as the
//! portable baseline and as the reference for plugin authors. Messages are
//! framed with a fixed 36-byte header; one-sided transfers are emulated by
//! streaming through a per-class region table, so `put`/`get` work anywhere
//! TCP does, without RDMA hardware.
//!
//! Endpoints come in two flavors. A listening endpoint binds a socket and is
//! addressable by peers; an anonymous endpoint only connects outward and is
//! identified by a random nonce carried in its hello frame. Each connection
//! starts with exactly one hello in each direction announcing the sender's
//! identity; frames arriving before the hello are dropped.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use slab::Slab;

use crate::addr::Addr;
use crate::config::{InitInfo, MemType, Offset, Tag};
use crate::error::{Error, Result};
use crate::info::Info;
use crate::mem::{MemHandle, Segment, MEM_READ_ONLY, MEM_WRITE_ONLY};
use crate::msg::BufShare;
use crate::op::{CbPayload, OpId, Submission};
use crate::plugin::{Plugin, PluginAddr, PluginContext, PluginEntry};

/// Registry entry for the TCP plugin.
pub const ENTRY: PluginEntry = PluginEntry {
    class_name: "tcp",
    check_protocol: |protocol| protocol == "tcp",
    initialize: TcpPlugin::initialize,
    cleanup: None,
};

const DEFAULT_MAX_UNEXPECTED: usize = 64 * 1024;
const DEFAULT_MAX_EXPECTED: usize = 1024 * 1024;

const FRAME_HDR: usize = 36;

const KIND_HELLO: u8 = 1;
const KIND_UNEXPECTED: u8 = 2;
const KIND_EXPECTED: u8 = 3;
const KIND_PUT: u8 = 4;
const KIND_GET_REQ: u8 = 5;
const KIND_GET_RESP: u8 = 6;

const HELLO_LISTENING: u8 = 0x01;

const GET_OK: u64 = 0;
const GET_BAD_HANDLE: u64 = 1;
const GET_PERM: u64 = 2;
const GET_BOUNDS: u64 = 3;

/// Peer identity: a listening endpoint's socket address, or an anonymous
/// endpoint's nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PeerId {
    Sock(SocketAddr),
    Anon(u64),
}

impl PeerId {
    fn to_uri(self) -> String {
        match self {
            PeerId::Sock(sa) => format!("tcp://{}", sa),
            PeerId::Anon(nonce) => format!("tcp://anon/{:016x}", nonce),
        }
    }

    fn from_uri(s: &str) -> Result<PeerId> {
        let rest = s.strip_prefix("tcp://").unwrap_or(s);
        if let Some(hex) = rest.strip_prefix("anon/") {
            let nonce = u64::from_str_radix(hex, 16)
                .map_err(|_| Error::InvalidArg(format!("malformed address: {}", s)))?;
            return Ok(PeerId::Anon(nonce));
        }
        let sa = rest
            .to_socket_addrs()
            .map_err(|_| Error::InvalidArg(format!("cannot resolve address: {}", s)))?
            .next()
            .ok_or(Error::AddrNotAvail)?;
        Ok(PeerId::Sock(sa))
    }
}

#[derive(Debug)]
struct TcpAddr {
    id: PeerId,
}

impl PluginAddr for TcpAddr {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn wrap_addr(id: PeerId) -> Addr {
    Addr::new(Arc::new(TcpAddr { id }))
}

fn peer_of(addr: &Addr) -> Result<PeerId> {
    Ok(addr.downcast::<TcpAddr>()?.id)
}

/// Memory-handle state. Local handles gain a region key at registration;
/// remote handles carry the owning class's nonce and key.
#[derive(Debug)]
enum TcpMemHandle {
    Local {
        segment: Segment,
        key: Mutex<Option<usize>>,
    },
    Remote {
        nonce: u64,
        key: u64,
    },
}

impl crate::plugin::PluginMemHandle for TcpMemHandle {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct TcpContext {
    id: u8,
}

impl PluginContext for TcpContext {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn id(&self) -> u8 {
        self.id
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    kind: u8,
    src_id: u8,
    dest_id: u8,
    flags: u8,
    tag: u32,
    a: u64,
    b: u64,
    c: u64,
    len: u32,
}

impl Header {
    fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.kind);
        out.put_u8(self.src_id);
        out.put_u8(self.dest_id);
        out.put_u8(self.flags);
        out.put_u32_le(self.tag);
        out.put_u64_le(self.a);
        out.put_u64_le(self.b);
        out.put_u64_le(self.c);
        out.put_u32_le(self.len);
    }

    fn decode(mut buf: &[u8]) -> Header {
        Header {
            kind: buf.get_u8(),
            src_id: buf.get_u8(),
            dest_id: buf.get_u8(),
            flags: buf.get_u8(),
            tag: buf.get_u32_le(),
            a: buf.get_u64_le(),
            b: buf.get_u64_le(),
            c: buf.get_u64_le(),
            len: buf.get_u32_le(),
        }
    }
}

struct Conn {
    stream: TcpStream,
    rbuf: BytesMut,
    wbuf: BytesMut,
    peer: Option<PeerId>,
}

struct PostedUnexpected {
    sub: Submission,
    buf: BufShare,
}

struct PostedExpected {
    sub: Submission,
    buf: BufShare,
    source: PeerId,
    source_id: u8,
    tag: Tag,
}

struct PendingGet {
    sub: Submission,
    conn: usize,
    dest_base: u64,
    dest_offset: u64,
    len: usize,
}

struct Region {
    base: u64,
    len: usize,
    flags: u32,
}

#[derive(Default)]
struct TcpState {
    conns: Slab<Conn>,
    by_peer: HashMap<PeerId, usize>,
    regions: Slab<Region>,
    unexpected: HashMap<u8, Vec<PostedUnexpected>>,
    expected: HashMap<u8, Vec<PostedExpected>>,
    gets: Slab<PendingGet>,
}

pub(crate) struct TcpPlugin {
    listener: Option<TcpListener>,
    self_id: PeerId,
    nonce: u64,
    auth_hash: u64,
    max_unexpected: usize,
    max_expected: usize,
    state: Mutex<TcpState>,
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    h
}

fn fresh_nonce() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    now ^ (u64::from(std::process::id()) << 32) ^ fnv1a(&now.to_le_bytes())
}

impl TcpPlugin {
    fn initialize(info: &Info, opts: &InitInfo, listen: bool) -> Result<Box<dyn Plugin>> {
        let nonce = fresh_nonce();
        let auth_hash = opts
            .auth_key
            .as_deref()
            .map(|k| fnv1a(k.as_bytes()))
            .unwrap_or(0);

        let (listener, self_id) = if listen {
            let host = info.host.as_deref().unwrap_or("0.0.0.0");
            let port = info.port.unwrap_or(0);
            let bind_addr = (host, port)
                .to_socket_addrs()
                .map_err(|_| Error::AddrNotAvail)?
                .next()
                .ok_or(Error::AddrNotAvail)?;
            let listener = TcpListener::bind(bind_addr).map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => Error::AddrInUse,
                _ => Error::from(e),
            })?;
            listener.set_nonblocking(true)?;
            let local = listener.local_addr()?;
            (Some(listener), PeerId::Sock(local))
        } else {
            (None, PeerId::Anon(nonce))
        };

        let max_unexpected = if opts.max_unexpected_size > 0 {
            opts.max_unexpected_size
        } else {
            DEFAULT_MAX_UNEXPECTED
        };
        let max_expected = if opts.max_expected_size > 0 {
            opts.max_expected_size
        } else {
            DEFAULT_MAX_EXPECTED
        };

        Ok(Box::new(TcpPlugin {
            listener,
            self_id,
            nonce,
            auth_hash,
            max_unexpected,
            max_expected,
            state: Mutex::new(TcpState::default()),
        }))
    }

    fn hello_frame(&self, out: &mut BytesMut) {
        let (flags, payload) = match self.self_id {
            PeerId::Sock(sa) => (HELLO_LISTENING, sa.to_string().into_bytes()),
            PeerId::Anon(_) => (0, Vec::new()),
        };
        Header {
            kind: KIND_HELLO,
            src_id: 0,
            dest_id: 0,
            flags,
            tag: 0,
            a: self.nonce,
            b: self.auth_hash,
            c: 0,
            len: payload.len() as u32,
        }
        .encode(out);
        out.extend_from_slice(&payload);
    }

    /// Find or establish the connection to a peer. Connecting is blocking;
    /// lookup-and-send callers accept that.
    fn conn_to(&self, state: &mut TcpState, peer: PeerId) -> Result<usize> {
        if let Some(&idx) = state.by_peer.get(&peer) {
            return Ok(idx);
        }
        let sa = match peer {
            PeerId::Sock(sa) => sa,
            // Anonymous peers are only reachable over a connection they
            // opened to us.
            PeerId::Anon(_) => return Err(Error::HostUnreach),
        };
        let stream = TcpStream::connect(sa).map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => Error::HostUnreach,
            _ => Error::from(e),
        })?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;

        let mut wbuf = BytesMut::new();
        self.hello_frame(&mut wbuf);
        let idx = state.conns.insert(Conn {
            stream,
            rbuf: BytesMut::new(),
            wbuf,
            peer: Some(peer),
        });
        state.by_peer.insert(peer, idx);
        flush_conn(state, idx);
        Ok(idx)
    }

    fn send_msg(
        &self,
        context: &dyn PluginContext,
        sub: Submission,
        buf: BufShare,
        buf_size: usize,
        dest: &Addr,
        dest_id: u8,
        tag: Tag,
        kind: u8,
    ) -> Result<()> {
        let peer = peer_of(dest)?;
        let src_id = context.id();

        if peer == self.self_id {
            let mut payload = Vec::new();
            buf.copy_out(0, buf_size, &mut payload);
            let mut state = self.state.lock();
            self.deliver_local(&mut state, kind, src_id, dest_id, tag, self.self_id, &payload);
            drop(state);
            sub.complete(Ok(()), CbPayload::None);
            return Ok(());
        }

        let mut payload = Vec::new();
        buf.copy_out(0, buf_size, &mut payload);
        {
            let mut state = self.state.lock();
            let idx = self.conn_to(&mut state, peer)?;
            let conn = &mut state.conns[idx];
            Header {
                kind,
                src_id,
                dest_id,
                flags: 0,
                tag,
                a: 0,
                b: 0,
                c: 0,
                len: payload.len() as u32,
            }
            .encode(&mut conn.wbuf);
            conn.wbuf.extend_from_slice(&payload);
            flush_conn(&mut state, idx);
        }
        // The bytes are out of the caller's buffer; at-most-once delivery
        // with no receiver feedback means the send is done now.
        sub.complete(Ok(()), CbPayload::None);
        Ok(())
    }

    /// Route a frame that never left this process.
    fn deliver_local(
        &self,
        state: &mut TcpState,
        kind: u8,
        src_id: u8,
        dest_id: u8,
        tag: Tag,
        source: PeerId,
        payload: &[u8],
    ) {
        match kind {
            KIND_UNEXPECTED => {
                let posted = state
                    .unexpected
                    .get_mut(&dest_id)
                    .and_then(|q| (!q.is_empty()).then(|| q.remove(0)));
                match posted {
                    Some(p) => complete_recv_unexpected(p, source, tag, payload),
                    None => {
                        log::debug!("dropping unmatched unexpected message (tag {})", tag);
                    }
                }
            }
            KIND_EXPECTED => {
                let posted = state.expected.get_mut(&dest_id).and_then(|q| {
                    q.iter()
                        .position(|p| p.source == source && p.source_id == src_id && p.tag == tag)
                        .map(|i| q.remove(i))
                });
                match posted {
                    Some(p) => complete_recv_expected(p, payload),
                    None => {
                        log::debug!("dropping unmatched expected message (tag {})", tag);
                    }
                }
            }
            _ => {}
        }
    }

    fn region_lookup(
        state: &TcpState,
        nonce_ok: bool,
        key: u64,
        offset: u64,
        len: usize,
        need: u32,
    ) -> std::result::Result<u64, u64> {
        if !nonce_ok {
            return Err(GET_BAD_HANDLE);
        }
        let region = state.regions.get(key as usize).ok_or(GET_BAD_HANDLE)?;
        if region.flags & need == 0 {
            return Err(GET_PERM);
        }
        let end = offset.checked_add(len as u64).ok_or(GET_BOUNDS)?;
        if end > region.len as u64 {
            return Err(GET_BOUNDS);
        }
        Ok(region.base + offset)
    }

    /// Process one complete frame received on `idx`. Returns the number of
    /// completions enqueued.
    fn handle_frame(&self, state: &mut TcpState, idx: usize, header: Header, payload: &[u8]) -> usize {
        if header.kind == KIND_HELLO {
            if header.b != self.auth_hash {
                log::warn!("rejecting peer with mismatched authentication key");
                drop_conn(state, idx);
                return 0;
            }
            let peer = if header.flags & HELLO_LISTENING != 0 {
                match std::str::from_utf8(payload).ok().and_then(|s| s.parse().ok()) {
                    Some(sa) => PeerId::Sock(sa),
                    None => {
                        log::warn!("malformed hello frame, closing connection");
                        drop_conn(state, idx);
                        return 0;
                    }
                }
            } else {
                PeerId::Anon(header.a)
            };
            if state.conns[idx].peer.is_none() {
                state.conns[idx].peer = Some(peer);
                state.by_peer.entry(peer).or_insert(idx);
            }
            return 0;
        }

        let source = match state.conns[idx].peer {
            Some(peer) => peer,
            None => {
                log::debug!("dropping frame received before hello");
                return 0;
            }
        };

        match header.kind {
            KIND_UNEXPECTED | KIND_EXPECTED => {
                let before = self.pending_recvs(state, header.dest_id);
                self.deliver_local(
                    state,
                    header.kind,
                    header.src_id,
                    header.dest_id,
                    header.tag,
                    source,
                    payload,
                );
                usize::from(self.pending_recvs(state, header.dest_id) != before)
            }
            KIND_PUT => {
                let nonce_ok = header.a == self.nonce;
                match Self::region_lookup(
                    state,
                    nonce_ok,
                    header.b,
                    header.c,
                    payload.len(),
                    MEM_WRITE_ONLY,
                ) {
                    Ok(dest) => unsafe {
                        std::ptr::copy_nonoverlapping(
                            payload.as_ptr(),
                            dest as *mut u8,
                            payload.len(),
                        );
                    },
                    Err(status) => {
                        log::warn!("rejecting one-sided write (status {})", status);
                    }
                }
                0
            }
            KIND_GET_REQ => {
                let req_len = if payload.len() >= 8 {
                    u64::from_le_bytes([
                        payload[0], payload[1], payload[2], payload[3], payload[4], payload[5],
                        payload[6], payload[7],
                    ]) as usize
                } else {
                    0
                };
                let nonce_ok = header.a == self.nonce;
                let (status, data) = match Self::region_lookup(
                    state,
                    nonce_ok,
                    header.b,
                    header.c,
                    req_len,
                    MEM_READ_ONLY,
                ) {
                    Ok(src) => {
                        let mut data = vec![0u8; req_len];
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                src as *const u8,
                                data.as_mut_ptr(),
                                req_len,
                            );
                        }
                        (GET_OK, data)
                    }
                    Err(status) => (status, Vec::new()),
                };
                let conn = &mut state.conns[idx];
                Header {
                    kind: KIND_GET_RESP,
                    src_id: 0,
                    dest_id: 0,
                    flags: 0,
                    tag: header.tag,
                    a: status,
                    b: 0,
                    c: 0,
                    len: data.len() as u32,
                }
                .encode(&mut conn.wbuf);
                conn.wbuf.extend_from_slice(&data);
                flush_conn(state, idx);
                0
            }
            KIND_GET_RESP => {
                let req = header.tag as usize;
                let pending = if state.gets.contains(req) {
                    Some(state.gets.remove(req))
                } else {
                    None
                };
                match pending {
                    Some(p) => {
                        if header.a == GET_OK && payload.len() == p.len {
                            unsafe {
                                std::ptr::copy_nonoverlapping(
                                    payload.as_ptr(),
                                    (p.dest_base + p.dest_offset) as *mut u8,
                                    payload.len(),
                                );
                            }
                            p.sub.complete(Ok(()), CbPayload::None);
                        } else {
                            let err = match header.a {
                                GET_PERM => Error::Permission,
                                GET_BOUNDS | GET_BAD_HANDLE => {
                                    Error::InvalidArg("remote rejected region access".into())
                                }
                                _ => Error::ProtocolError("truncated get response".into()),
                            };
                            p.sub.complete(Err(err), CbPayload::None);
                        }
                        1
                    }
                    None => {
                        log::debug!("dropping get response for unknown request {}", req);
                        0
                    }
                }
            }
            other => {
                log::warn!("dropping frame with unknown kind {}", other);
                0
            }
        }
    }

    fn pending_recvs(&self, state: &TcpState, ctx_id: u8) -> usize {
        state.unexpected.get(&ctx_id).map_or(0, Vec::len)
            + state.expected.get(&ctx_id).map_or(0, Vec::len)
    }

    /// Accept new connections and service readable/writable sockets once.
    /// Returns the number of completions enqueued.
    fn service(&self, state: &mut TcpState) -> usize {
        if let Some(listener) = &self.listener {
            loop {
                match listener.accept() {
                    Ok((stream, _)) => {
                        if stream.set_nodelay(true).is_err() || stream.set_nonblocking(true).is_err()
                        {
                            continue;
                        }
                        let mut wbuf = BytesMut::new();
                        self.hello_frame(&mut wbuf);
                        let idx = state.conns.insert(Conn {
                            stream,
                            rbuf: BytesMut::new(),
                            wbuf,
                            peer: None,
                        });
                        flush_conn(state, idx);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                        break;
                    }
                }
            }
        }

        let mut delivered = 0;
        let indices: Vec<usize> = state.conns.iter().map(|(i, _)| i).collect();
        for idx in indices {
            if !state.conns.contains(idx) {
                continue;
            }
            // Drain the socket into the reassembly buffer.
            let mut dead = false;
            loop {
                let conn = &mut state.conns[idx];
                let mut chunk = [0u8; 16 * 1024];
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        dead = true;
                        break;
                    }
                    Ok(n) => conn.rbuf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::debug!("connection read failed: {}", e);
                        dead = true;
                        break;
                    }
                }
            }

            // Parse complete frames.
            loop {
                let conn = &mut state.conns[idx];
                if conn.rbuf.len() < FRAME_HDR {
                    break;
                }
                let header = Header::decode(&conn.rbuf[..FRAME_HDR]);
                let total = FRAME_HDR + header.len as usize;
                if conn.rbuf.len() < total {
                    break;
                }
                conn.rbuf.advance(FRAME_HDR);
                let payload = conn.rbuf.split_to(header.len as usize);
                delivered += self.handle_frame(state, idx, header, &payload);
                if !state.conns.contains(idx) {
                    break;
                }
            }

            if state.conns.contains(idx) {
                flush_conn(state, idx);
                if dead {
                    drop_conn(state, idx);
                }
            }
        }
        delivered
    }

    fn poll_fds(&self, state: &TcpState) -> Vec<libc::pollfd> {
        let mut fds = Vec::with_capacity(state.conns.len() + 1);
        if let Some(listener) = &self.listener {
            fds.push(libc::pollfd {
                fd: listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }
        for (_, conn) in state.conns.iter() {
            let mut events = libc::POLLIN;
            if !conn.wbuf.is_empty() {
                events |= libc::POLLOUT;
            }
            fds.push(libc::pollfd {
                fd: conn.stream.as_raw_fd(),
                events,
                revents: 0,
            });
        }
        fds
    }
}

fn complete_recv_unexpected(posted: PostedUnexpected, source: PeerId, tag: Tag, payload: &[u8]) {
    if payload.len() > posted.buf.capacity() {
        posted.sub.complete(
            Err(Error::MsgSize {
                size: payload.len(),
                max: posted.buf.capacity(),
            }),
            CbPayload::None,
        );
        return;
    }
    posted.buf.copy_in(0, payload);
    posted.sub.complete(
        Ok(()),
        CbPayload::RecvUnexpected {
            actual_buf_size: payload.len(),
            source: wrap_addr(source),
            tag,
        },
    );
}

fn complete_recv_expected(posted: PostedExpected, payload: &[u8]) {
    if payload.len() > posted.buf.capacity() {
        posted.sub.complete(
            Err(Error::MsgSize {
                size: payload.len(),
                max: posted.buf.capacity(),
            }),
            CbPayload::None,
        );
        return;
    }
    posted.buf.copy_in(0, payload);
    posted.sub.complete(
        Ok(()),
        CbPayload::RecvExpected {
            actual_buf_size: payload.len(),
        },
    );
}

/// Write as much buffered output as the socket accepts.
fn flush_conn(state: &mut TcpState, idx: usize) {
    loop {
        let conn = &mut state.conns[idx];
        if conn.wbuf.is_empty() {
            return;
        }
        match conn.stream.write(&conn.wbuf) {
            Ok(0) => return,
            Ok(n) => {
                conn.wbuf.advance(n);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("connection write failed: {}", e);
                drop_conn(state, idx);
                return;
            }
        }
    }
}

fn drop_conn(state: &mut TcpState, idx: usize) {
    let conn = state.conns.remove(idx);
    if let Some(peer) = conn.peer {
        if state.by_peer.get(&peer) == Some(&idx) {
            state.by_peer.remove(&peer);
        }
    }
    // Gets waiting on a response over this connection can never complete
    // normally anymore; resolve them now so exactly one callback still
    // fires per submission.
    let orphaned: Vec<usize> = state
        .gets
        .iter()
        .filter(|(_, p)| p.conn == idx)
        .map(|(i, _)| i)
        .collect();
    for i in orphaned {
        let pending = state.gets.remove(i);
        pending.sub.complete(Err(Error::HostUnreach), CbPayload::None);
    }
}

fn local_segment(handle: &MemHandle) -> Result<Segment> {
    match handle.downcast::<TcpMemHandle>()? {
        TcpMemHandle::Local { segment, .. } => Ok(*segment),
        TcpMemHandle::Remote { .. } => {
            Err(Error::InvalidArg("expected a local memory handle".into()))
        }
    }
}

/// Nonce and region key naming the remote side of a transfer. A local
/// registered handle also qualifies, for loopback transfers.
fn remote_key(handle: &MemHandle, own_nonce: u64) -> Result<(u64, u64)> {
    match handle.downcast::<TcpMemHandle>()? {
        TcpMemHandle::Remote { nonce, key } => Ok((*nonce, *key)),
        TcpMemHandle::Local { key, .. } => match *key.lock() {
            Some(k) => Ok((own_nonce, k as u64)),
            None => Err(Error::InvalidArg("memory handle is not registered".into())),
        },
    }
}

impl Plugin for TcpPlugin {
    fn finalize(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.conns.clear();
        state.by_peer.clear();
        state.regions.clear();
        Ok(())
    }

    fn context_create(
        &self,
        id: u8,
        _queue: Arc<crate::op::CompletionQueue>,
    ) -> Result<Box<dyn PluginContext>> {
        let mut state = self.state.lock();
        state.unexpected.entry(id).or_default();
        state.expected.entry(id).or_default();
        Ok(Box::new(TcpContext { id }))
    }

    fn context_destroy(&self, context: Box<dyn PluginContext>) -> Result<()> {
        let mut state = self.state.lock();
        // Posted receives die with the context; their callbacks never run.
        state.unexpected.remove(&context.id());
        state.expected.remove(&context.id());
        Ok(())
    }

    fn addr_lookup(&self, name: &str) -> Result<Addr> {
        Ok(wrap_addr(PeerId::from_uri(name)?))
    }

    fn addr_self(&self) -> Result<Addr> {
        Ok(wrap_addr(self.self_id))
    }

    fn addr_cmp(&self, a: &Addr, b: &Addr) -> bool {
        match (peer_of(a), peer_of(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    fn addr_is_self(&self, addr: &Addr) -> bool {
        peer_of(addr).map(|id| id == self.self_id).unwrap_or(false)
    }

    fn addr_to_string(&self, addr: &Addr) -> Result<String> {
        Ok(peer_of(addr)?.to_uri())
    }

    fn addr_serialize_size(&self, addr: &Addr) -> usize {
        peer_of(addr).map(|id| id.to_uri().len()).unwrap_or(0)
    }

    fn addr_serialize(&self, buf: &mut [u8], addr: &Addr) -> Result<()> {
        let uri = peer_of(addr)?.to_uri();
        buf.copy_from_slice(uri.as_bytes());
        Ok(())
    }

    fn addr_deserialize(&self, buf: &[u8]) -> Result<Addr> {
        let uri = std::str::from_utf8(buf)
            .map_err(|_| Error::InvalidArg("address bytes are not valid UTF-8".into()))?;
        Ok(wrap_addr(PeerId::from_uri(uri)?))
    }

    fn msg_max_unexpected_size(&self) -> usize {
        self.max_unexpected
    }

    fn msg_max_expected_size(&self) -> usize {
        self.max_expected
    }

    fn msg_max_tag(&self) -> Tag {
        Tag::MAX
    }

    fn msg_send_unexpected(
        &self,
        context: &dyn PluginContext,
        sub: Submission,
        buf: BufShare,
        buf_size: usize,
        dest: &Addr,
        dest_id: u8,
        tag: Tag,
    ) -> Result<()> {
        self.send_msg(context, sub, buf, buf_size, dest, dest_id, tag, KIND_UNEXPECTED)
    }

    fn msg_recv_unexpected(
        &self,
        context: &dyn PluginContext,
        sub: Submission,
        buf: BufShare,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state
            .unexpected
            .entry(context.id())
            .or_default()
            .push(PostedUnexpected { sub, buf });
        Ok(())
    }

    fn msg_send_expected(
        &self,
        context: &dyn PluginContext,
        sub: Submission,
        buf: BufShare,
        buf_size: usize,
        dest: &Addr,
        dest_id: u8,
        tag: Tag,
    ) -> Result<()> {
        self.send_msg(context, sub, buf, buf_size, dest, dest_id, tag, KIND_EXPECTED)
    }

    fn msg_recv_expected(
        &self,
        context: &dyn PluginContext,
        sub: Submission,
        buf: BufShare,
        source: &Addr,
        source_id: u8,
        tag: Tag,
    ) -> Result<()> {
        let source = peer_of(source)?;
        let mut state = self.state.lock();
        state.expected.entry(context.id()).or_default().push(PostedExpected {
            sub,
            buf,
            source,
            source_id,
            tag,
        });
        Ok(())
    }

    fn mem_handle_create(&self, segments: &[Segment], flags: u32) -> Result<MemHandle> {
        // Contiguous regions only; the class layer enforces the count.
        let segment = segments[0];
        let inner = Arc::new(TcpMemHandle::Local {
            segment,
            key: Mutex::new(None),
        });
        Ok(MemHandle::new_local(inner, flags, segment.len))
    }

    fn mem_register(&self, handle: &MemHandle, mem_type: MemType, _device: u64) -> Result<()> {
        if mem_type != MemType::Host {
            return Err(Error::OpNotSupported);
        }
        match handle.downcast::<TcpMemHandle>()? {
            TcpMemHandle::Local { segment, key } => {
                let mut state = self.state.lock();
                let k = state.regions.insert(Region {
                    base: segment.base,
                    len: segment.len,
                    flags: handle.flags(),
                });
                *key.lock() = Some(k);
                Ok(())
            }
            TcpMemHandle::Remote { .. } => {
                Err(Error::InvalidArg("cannot register a remote handle".into()))
            }
        }
    }

    fn mem_deregister(&self, handle: &MemHandle) -> Result<()> {
        match handle.downcast::<TcpMemHandle>()? {
            TcpMemHandle::Local { key, .. } => {
                if let Some(k) = key.lock().take() {
                    let mut state = self.state.lock();
                    if state.regions.contains(k) {
                        state.regions.remove(k);
                    }
                }
                Ok(())
            }
            TcpMemHandle::Remote { .. } => Ok(()),
        }
    }

    fn mem_handle_serialize_size(&self, _handle: &MemHandle) -> usize {
        // nonce + key + flags + region length
        8 + 8 + 4 + 8
    }

    fn mem_handle_serialize(&self, buf: &mut [u8], handle: &MemHandle) -> Result<()> {
        let (nonce, key) = remote_key(handle, self.nonce)?;
        let mut out = buf;
        out.put_u64_le(nonce);
        out.put_u64_le(key);
        out.put_u32_le(handle.flags());
        out.put_u64_le(handle.len() as u64);
        Ok(())
    }

    fn mem_handle_deserialize(&self, buf: &[u8]) -> Result<MemHandle> {
        if buf.len() < 28 {
            return Err(Error::InvalidArg("truncated memory handle".into()));
        }
        let mut b = buf;
        let nonce = b.get_u64_le();
        let key = b.get_u64_le();
        let flags = b.get_u32_le();
        let len = b.get_u64_le() as usize;
        Ok(MemHandle::new_remote(
            Arc::new(TcpMemHandle::Remote { nonce, key }),
            flags,
            len,
        ))
    }

    fn put(
        &self,
        context: &dyn PluginContext,
        sub: Submission,
        local: &MemHandle,
        local_offset: Offset,
        remote: &MemHandle,
        remote_offset: Offset,
        len: usize,
        remote_addr: &Addr,
        _remote_id: u8,
    ) -> Result<()> {
        let _ = context;
        let segment = local_segment(local)?;
        let (nonce, key) = remote_key(remote, self.nonce)?;
        let src = segment.base + local_offset;

        if self.addr_is_self(remote_addr) {
            let state = self.state.lock();
            match Self::region_lookup(&state, nonce == self.nonce, key, remote_offset, len, MEM_WRITE_ONLY)
            {
                Ok(dest) => {
                    unsafe {
                        std::ptr::copy(src as *const u8, dest as *mut u8, len);
                    }
                    drop(state);
                    sub.complete(Ok(()), CbPayload::None);
                    Ok(())
                }
                Err(_) => Err(Error::Access),
            }
        } else {
            let mut payload = vec![0u8; len];
            unsafe {
                std::ptr::copy_nonoverlapping(src as *const u8, payload.as_mut_ptr(), len);
            }
            let mut state = self.state.lock();
            let idx = self.conn_to(&mut state, peer_of(remote_addr)?)?;
            let conn = &mut state.conns[idx];
            Header {
                kind: KIND_PUT,
                src_id: 0,
                dest_id: 0,
                flags: 0,
                tag: 0,
                a: nonce,
                b: key,
                c: remote_offset,
                len: len as u32,
            }
            .encode(&mut conn.wbuf);
            conn.wbuf.extend_from_slice(&payload);
            flush_conn(&mut state, idx);
            drop(state);
            sub.complete(Ok(()), CbPayload::None);
            Ok(())
        }
    }

    fn get(
        &self,
        context: &dyn PluginContext,
        sub: Submission,
        local: &MemHandle,
        local_offset: Offset,
        remote: &MemHandle,
        remote_offset: Offset,
        len: usize,
        remote_addr: &Addr,
        _remote_id: u8,
    ) -> Result<()> {
        let _ = context;
        let segment = local_segment(local)?;
        let (nonce, key) = remote_key(remote, self.nonce)?;
        let dest = segment.base + local_offset;

        if self.addr_is_self(remote_addr) {
            let state = self.state.lock();
            match Self::region_lookup(&state, nonce == self.nonce, key, remote_offset, len, MEM_READ_ONLY)
            {
                Ok(src) => {
                    unsafe {
                        std::ptr::copy(src as *const u8, dest as *mut u8, len);
                    }
                    drop(state);
                    sub.complete(Ok(()), CbPayload::None);
                    Ok(())
                }
                Err(_) => Err(Error::Access),
            }
        } else {
            let mut state = self.state.lock();
            let idx = self.conn_to(&mut state, peer_of(remote_addr)?)?;
            let req = state.gets.insert(PendingGet {
                sub,
                conn: idx,
                dest_base: segment.base,
                dest_offset: local_offset,
                len,
            });
            let conn = &mut state.conns[idx];
            Header {
                kind: KIND_GET_REQ,
                src_id: 0,
                dest_id: 0,
                flags: 0,
                tag: req as u32,
                a: nonce,
                b: key,
                c: remote_offset,
                len: 8,
            }
            .encode(&mut conn.wbuf);
            conn.wbuf.put_u64_le(len as u64);
            flush_conn(&mut state, idx);
            Ok(())
        }
    }

    fn poll_get_fd(&self, _context: &dyn PluginContext) -> Option<RawFd> {
        self.listener.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn poll_try_wait(&self, _context: &dyn PluginContext) -> bool {
        let state = self.state.lock();
        state.conns.iter().all(|(_, c)| c.rbuf.len() < FRAME_HDR)
    }

    fn progress(&self, _context: &dyn PluginContext, timeout_ms: u32) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        loop {
            let fds = {
                let mut state = self.state.lock();
                let delivered = self.service(&mut state);
                if delivered > 0 {
                    return Ok(());
                }
                self.poll_fds(&state)
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && timeout_ms != 0 {
                return Err(Error::Timeout);
            }

            // Wait in bounded slices so submissions from other threads are
            // not starved behind a long poll.
            let slice = remaining.min(Duration::from_millis(100)).as_millis() as i32;
            let mut fds = fds;
            let n = if fds.is_empty() {
                std::thread::sleep(Duration::from_millis(slice.max(0) as u64));
                0
            } else {
                unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, slice) }
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::from(err));
            }

            if timeout_ms == 0 {
                let mut state = self.state.lock();
                let delivered = self.service(&mut state);
                return if delivered > 0 { Ok(()) } else { Err(Error::Timeout) };
            }
        }
    }

    fn cancel(&self, _context: &dyn PluginContext, op: &OpId) -> Result<()> {
        let canceled = {
            let mut state = self.state.lock();
            let mut found = None;
            for q in state.unexpected.values_mut() {
                if let Some(i) = q.iter().position(|p| p.sub.matches(op)) {
                    found = Some(q.remove(i).sub);
                    break;
                }
            }
            if found.is_none() {
                for q in state.expected.values_mut() {
                    if let Some(i) = q.iter().position(|p| p.sub.matches(op)) {
                        found = Some(q.remove(i).sub);
                        break;
                    }
                }
            }
            if found.is_none() {
                let req = state
                    .gets
                    .iter()
                    .find(|(_, p)| p.sub.matches(op))
                    .map(|(i, _)| i);
                if let Some(i) = req {
                    found = Some(state.gets.remove(i).sub);
                }
            }
            found
        };
        if let Some(sub) = canceled {
            sub.complete(Err(Error::Canceled), CbPayload::None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let h = Header {
            kind: KIND_EXPECTED,
            src_id: 3,
            dest_id: 1,
            flags: 0,
            tag: 42,
            a: 0xdead_beef,
            b: 7,
            c: 4096,
            len: 64,
        };
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), FRAME_HDR);

        let d = Header::decode(&buf);
        assert_eq!(d.kind, h.kind);
        assert_eq!(d.src_id, h.src_id);
        assert_eq!(d.dest_id, h.dest_id);
        assert_eq!(d.tag, h.tag);
        assert_eq!(d.a, h.a);
        assert_eq!(d.b, h.b);
        assert_eq!(d.c, h.c);
        assert_eq!(d.len, h.len);
    }

    #[test]
    fn peer_uri_round_trip() {
        let sock = PeerId::Sock("127.0.0.1:3344".parse().unwrap());
        assert_eq!(PeerId::from_uri(&sock.to_uri()).unwrap(), sock);

        let anon = PeerId::Anon(0x1234_5678_9abc_def0);
        assert_eq!(PeerId::from_uri(&anon.to_uri()).unwrap(), anon);
    }

    #[test]
    fn malformed_uris_are_rejected() {
        assert!(PeerId::from_uri("tcp://anon/zzz").is_err());
        assert!(PeerId::from_uri("tcp://").is_err());
    }

    #[test]
    fn fnv_is_stable() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_ne!(fnv1a(b"key-a"), fnv1a(b"key-b"));
    }
}
