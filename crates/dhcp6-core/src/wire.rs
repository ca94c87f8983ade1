//! DHCPv6 wire format (RFC 8415).
//!
//! Message framing, TLV option lists and the bounded writer used to build
//! replies. Encapsulating options (IA_NA, IA_PD, ...) are opened with a
//! placeholder length that is patched once their content is complete.

use std::fmt;
use std::net::Ipv6Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

// ── DHCPv6 message types ────────────────────────────────────────────────────

pub const MSG_SOLICIT: u8 = 1;
pub const MSG_ADVERTISE: u8 = 2;
pub const MSG_REQUEST: u8 = 3;
pub const MSG_CONFIRM: u8 = 4;
pub const MSG_RENEW: u8 = 5;
pub const MSG_REBIND: u8 = 6;
pub const MSG_REPLY: u8 = 7;
pub const MSG_RELEASE: u8 = 8;
pub const MSG_DECLINE: u8 = 9;
pub const MSG_RECONFIGURE: u8 = 10;
pub const MSG_INFORMATION_REQUEST: u8 = 11;
pub const MSG_RELAY_FORW: u8 = 12;
pub const MSG_RELAY_REPL: u8 = 13;

// ── DHCPv6 option codes ─────────────────────────────────────────────────────

pub const OPT_CLIENTID: u16 = 1;
pub const OPT_SERVERID: u16 = 2;
pub const OPT_IA_NA: u16 = 3;
pub const OPT_IA_TA: u16 = 4;
pub const OPT_IAADDR: u16 = 5;
pub const OPT_ORO: u16 = 6;
pub const OPT_PREFERENCE: u16 = 7;
pub const OPT_ELAPSED_TIME: u16 = 8;
pub const OPT_RELAY_MSG: u16 = 9;
pub const OPT_STATUS_CODE: u16 = 13;
pub const OPT_RAPID_COMMIT: u16 = 14;
pub const OPT_USER_CLASS: u16 = 15;
pub const OPT_VENDOR_CLASS: u16 = 16;
pub const OPT_INTERFACE_ID: u16 = 18;
pub const OPT_RECONF_ACCEPT: u16 = 20;
pub const OPT_DNS_SERVERS: u16 = 23;
pub const OPT_DOMAIN_LIST: u16 = 24;
pub const OPT_IA_PD: u16 = 25;
pub const OPT_IAPREFIX: u16 = 26;
pub const OPT_INFORMATION_REFRESH_TIME: u16 = 32;
pub const OPT_ERO: u16 = 43;

// ── Transport constants ─────────────────────────────────────────────────────

pub const CLIENT_PORT: u16 = 546;
pub const SERVER_PORT: u16 = 547;
pub const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

const MESSAGE_HEADER_LEN: usize = 4;
pub const RELAY_HEADER_LEN: usize = 34;
pub const OPTION_HEADER_LEN: usize = 4;
const IAADDR_LEN: usize = 24;
const IAPREFIX_LEN: usize = 25;

/// Human-readable message type name for logs.
pub fn message_name(msg_type: u8) -> &'static str {
    match msg_type {
        MSG_SOLICIT => "Solicit",
        MSG_ADVERTISE => "Advertise",
        MSG_REQUEST => "Request",
        MSG_CONFIRM => "Confirm",
        MSG_RENEW => "Renew",
        MSG_REBIND => "Rebind",
        MSG_REPLY => "Reply",
        MSG_RELEASE => "Release",
        MSG_DECLINE => "Decline",
        MSG_RECONFIGURE => "Reconfigure",
        MSG_INFORMATION_REQUEST => "Information-request",
        MSG_RELAY_FORW => "Relay-forward",
        MSG_RELAY_REPL => "Relay-reply",
        _ => "Unknown",
    }
}

// ── Status codes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusCode {
    Success = 0,
    UnspecFail = 1,
    NoAddrsAvail = 2,
    NoBinding = 3,
    NotOnLink = 4,
    UseMulticast = 5,
    NoPrefixAvail = 6,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Payload of a STATUS_CODE option.
pub fn status_data(status: StatusCode, message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + message.len());
    buf.put_u16(status.code());
    buf.put_slice(message.as_bytes());
    buf.freeze()
}

/// Decode a STATUS_CODE payload into its numeric code and message.
pub fn parse_status(data: &[u8]) -> Option<(u16, String)> {
    if data.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([data[0], data[1]]);
    Some((code, String::from_utf8_lossy(&data[2..]).into_owned()))
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message too short ({0} bytes)")]
    Truncated(usize),

    #[error("option header truncated ({0} trailing bytes)")]
    TruncatedOption(usize),

    #[error("option {code} declares {len} bytes but only {available} remain")]
    OptionOverrun { code: u16, len: usize, available: usize },

    #[error("{option} option too short ({len} bytes)")]
    ShortOption { option: &'static str, len: usize },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("reply buffer exhausted")]
pub struct NoSpace;

// ── Option lists ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: u16,
    pub data: Bytes,
}

impl DhcpOption {
    pub fn new(code: u16, data: impl Into<Bytes>) -> Self {
        Self { code, data: data.into() }
    }
}

/// Ordered list of options. Codes may repeat (several IA_NA, several IAADDR).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    list: Vec<DhcpOption>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(mut data: &[u8]) -> Result<Self, WireError> {
        let mut list = Vec::new();
        while data.has_remaining() {
            if data.remaining() < OPTION_HEADER_LEN {
                return Err(WireError::TruncatedOption(data.remaining()));
            }
            let code = data.get_u16();
            let len = data.get_u16() as usize;
            if len > data.remaining() {
                return Err(WireError::OptionOverrun {
                    code,
                    len,
                    available: data.remaining(),
                });
            }
            list.push(DhcpOption {
                code,
                data: Bytes::copy_from_slice(&data[..len]),
            });
            data.advance(len);
        }
        Ok(Self { list })
    }

    pub fn push(&mut self, code: u16, data: impl Into<Bytes>) {
        self.list.push(DhcpOption::new(code, data));
    }

    /// Replace every option with `code` by a single new one.
    pub fn set(&mut self, code: u16, data: impl Into<Bytes>) {
        self.remove(code);
        self.push(code, data);
    }

    pub fn remove(&mut self, code: u16) {
        self.list.retain(|o| o.code != code);
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }

    pub fn get(&self, code: u16) -> Option<&Bytes> {
        self.list.iter().find(|o| o.code == code).map(|o| &o.data)
    }

    pub fn get_all(&self, code: u16) -> impl Iterator<Item = &Bytes> + '_ {
        self.list.iter().filter(move |o| o.code == code).map(|o| &o.data)
    }

    pub fn contains(&self, code: u16) -> bool {
        self.list.iter().any(|o| o.code == code)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DhcpOption> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Option codes carried by an ORO/ERO-style option (a list of u16).
    pub fn requested_codes(&self, code: u16) -> Vec<u16> {
        match self.get(code) {
            Some(data) => data
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect(),
            None => Vec::new(),
        }
    }
}

// ── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub msg_type: u8,
    pub transaction_id: [u8; 3],
    pub options: Options,
}

impl ClientMessage {
    pub fn client_id(&self) -> Option<&Bytes> {
        self.options.get(OPT_CLIENTID)
    }

    pub fn server_id(&self) -> Option<&Bytes> {
        self.options.get(OPT_SERVERID)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub msg_type: u8,
    pub hop_count: u8,
    pub link_address: Ipv6Addr,
    pub peer_address: Ipv6Addr,
    pub options: Options,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Client(ClientMessage),
    Relay(RelayMessage),
}

impl Message {
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < MESSAGE_HEADER_LEN {
            return Err(WireError::Truncated(data.len()));
        }
        let mut buf = data;
        let msg_type = buf.get_u8();
        if msg_type == MSG_RELAY_FORW || msg_type == MSG_RELAY_REPL {
            if data.len() < RELAY_HEADER_LEN {
                return Err(WireError::Truncated(data.len()));
            }
            let hop_count = buf.get_u8();
            let link_address = get_addr(&mut buf);
            let peer_address = get_addr(&mut buf);
            return Ok(Message::Relay(RelayMessage {
                msg_type,
                hop_count,
                link_address,
                peer_address,
                options: Options::parse(buf)?,
            }));
        }
        let mut transaction_id = [0u8; 3];
        buf.copy_to_slice(&mut transaction_id);
        Ok(Message::Client(ClientMessage {
            msg_type,
            transaction_id,
            options: Options::parse(buf)?,
        }))
    }

    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Client(m) => m.msg_type,
            Message::Relay(m) => m.msg_type,
        }
    }

    pub fn options(&self) -> &Options {
        match self {
            Message::Client(m) => &m.options,
            Message::Relay(m) => &m.options,
        }
    }
}

fn get_addr(buf: &mut &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    buf.copy_to_slice(&mut octets);
    Ipv6Addr::from(octets)
}

// ── Identity associations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IaKind {
    Na,
    Ta,
    Pd,
}

impl IaKind {
    pub fn option_code(self) -> u16 {
        match self {
            IaKind::Na => OPT_IA_NA,
            IaKind::Ta => OPT_IA_TA,
            IaKind::Pd => OPT_IA_PD,
        }
    }

    /// Fixed bytes before the IA's encapsulated options.
    pub fn header_len(self) -> usize {
        match self {
            IaKind::Ta => 4,
            IaKind::Na | IaKind::Pd => 12,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            IaKind::Na => "IA_NA",
            IaKind::Ta => "IA_TA",
            IaKind::Pd => "IA_PD",
        }
    }
}

impl fmt::Display for IaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One IA_NA/IA_TA/IA_PD as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaRequest {
    pub kind: IaKind,
    pub iaid: u32,
    pub t1: u32,
    pub t2: u32,
    pub options: Options,
}

impl IaRequest {
    pub fn parse(kind: IaKind, data: &[u8]) -> Result<Self, WireError> {
        if data.len() < kind.header_len() {
            return Err(WireError::ShortOption {
                option: kind.label(),
                len: data.len(),
            });
        }
        let mut buf = data;
        let iaid = buf.get_u32();
        let (t1, t2) = match kind {
            IaKind::Ta => (0, 0),
            IaKind::Na | IaKind::Pd => (buf.get_u32(), buf.get_u32()),
        };
        Ok(Self {
            kind,
            iaid,
            t1,
            t2,
            options: Options::parse(buf)?,
        })
    }

    /// Every IA of `kind` in an option list, in order.
    pub fn all(kind: IaKind, options: &Options) -> Result<Vec<Self>, WireError> {
        options
            .get_all(kind.option_code())
            .map(|data| Self::parse(kind, data))
            .collect()
    }

    pub fn addresses(&self) -> Vec<IaAddress> {
        self.options
            .get_all(OPT_IAADDR)
            .filter_map(|data| {
                let parsed = IaAddress::parse(data);
                if parsed.is_none() {
                    debug!("{} {}: skipping short IAADDR ({} bytes)", self.kind, self.iaid, data.len());
                }
                parsed
            })
            .collect()
    }

    pub fn prefixes(&self) -> Vec<IaPrefix> {
        self.options
            .get_all(OPT_IAPREFIX)
            .filter_map(|data| {
                let parsed = IaPrefix::parse(data);
                if parsed.is_none() {
                    debug!("{} {}: skipping short IAPREFIX ({} bytes)", self.kind, self.iaid, data.len());
                }
                parsed
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IaAddress {
    pub address: Ipv6Addr,
    pub preferred: u32,
    pub valid: u32,
}

impl IaAddress {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < IAADDR_LEN {
            return None;
        }
        let mut buf = data;
        let address = get_addr(&mut buf);
        Some(Self {
            address,
            preferred: buf.get_u32(),
            valid: buf.get_u32(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(IAADDR_LEN);
        buf.put_slice(&self.address.octets());
        buf.put_u32(self.preferred);
        buf.put_u32(self.valid);
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IaPrefix {
    pub preferred: u32,
    pub valid: u32,
    pub prefix_len: u8,
    pub prefix: Ipv6Addr,
}

impl IaPrefix {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < IAPREFIX_LEN {
            return None;
        }
        let mut buf = data;
        let preferred = buf.get_u32();
        let valid = buf.get_u32();
        let prefix_len = buf.get_u8();
        Some(Self {
            preferred,
            valid,
            prefix_len,
            prefix: get_addr(&mut buf),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(IAPREFIX_LEN);
        buf.put_u32(self.preferred);
        buf.put_u32(self.valid);
        buf.put_u8(self.prefix_len);
        buf.put_slice(&self.prefix.octets());
        buf.freeze()
    }
}

// ── Encoders for configured option values ───────────────────────────────────

pub fn encode_addresses(addrs: &[Ipv6Addr]) -> Bytes {
    let mut buf = BytesMut::with_capacity(addrs.len() * 16);
    for addr in addrs {
        buf.put_slice(&addr.octets());
    }
    buf.freeze()
}

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;

/// RFC 1035 uncompressed name list (DOMAIN_LIST). `None` when a label or a
/// whole name is too long to encode.
pub fn encode_domain_list(names: &[String]) -> Option<Bytes> {
    let mut buf = BytesMut::new();
    for name in names {
        let start = buf.len();
        for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
            if label.len() > MAX_LABEL_LEN {
                return None;
            }
            buf.put_u8(label.len() as u8);
            buf.put_slice(label.as_bytes());
        }
        buf.put_u8(0);
        if buf.len() - start > MAX_NAME_LEN {
            return None;
        }
    }
    Some(buf.freeze())
}

// ── Reply writer ────────────────────────────────────────────────────────────

/// Position of an opened option whose length is still a placeholder.
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct OptionMark {
    start: usize,
}

impl OptionMark {
    /// Offset of the first byte after the option header.
    pub fn body_offset(&self) -> usize {
        self.start + OPTION_HEADER_LEN
    }
}

/// Bounded output buffer. A write that would exceed the limit fails with
/// [`NoSpace`] and leaves the buffer unchanged.
#[derive(Debug)]
pub struct OptionWriter {
    buf: BytesMut,
    limit: usize,
}

impl OptionWriter {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit.min(1500)),
            limit,
        }
    }

    pub fn client_message(msg_type: u8, transaction_id: [u8; 3], limit: usize) -> Result<Self, NoSpace> {
        let mut w = Self::new(limit);
        w.put_u8(msg_type)?;
        w.put_slice(&transaction_id)?;
        Ok(w)
    }

    pub fn relay_message(
        msg_type: u8,
        hop_count: u8,
        link_address: Ipv6Addr,
        peer_address: Ipv6Addr,
        limit: usize,
    ) -> Result<Self, NoSpace> {
        let mut w = Self::new(limit);
        w.reserve(RELAY_HEADER_LEN)?;
        w.buf.put_u8(msg_type);
        w.buf.put_u8(hop_count);
        w.buf.put_slice(&link_address.octets());
        w.buf.put_slice(&peer_address.octets());
        Ok(w)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.buf.len())
    }

    fn reserve(&self, n: usize) -> Result<(), NoSpace> {
        if n > self.remaining() { Err(NoSpace) } else { Ok(()) }
    }

    pub fn put_u8(&mut self, v: u8) -> Result<(), NoSpace> {
        self.reserve(1)?;
        self.buf.put_u8(v);
        Ok(())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<(), NoSpace> {
        self.reserve(4)?;
        self.buf.put_u32(v);
        Ok(())
    }

    pub fn put_slice(&mut self, data: &[u8]) -> Result<(), NoSpace> {
        self.reserve(data.len())?;
        self.buf.put_slice(data);
        Ok(())
    }

    pub fn put_option(&mut self, code: u16, data: &[u8]) -> Result<(), NoSpace> {
        if data.len() > u16::MAX as usize {
            return Err(NoSpace);
        }
        self.reserve(OPTION_HEADER_LEN + data.len())?;
        self.buf.put_u16(code);
        self.buf.put_u16(data.len() as u16);
        self.buf.put_slice(data);
        Ok(())
    }

    /// Write the option when it fits, otherwise leave it out.
    pub fn put_option_if_fits(&mut self, code: u16, data: &[u8]) -> bool {
        self.put_option(code, data).is_ok()
    }

    /// Open an encapsulating option with a zero length placeholder.
    pub fn begin_option(&mut self, code: u16) -> Result<OptionMark, NoSpace> {
        self.reserve(OPTION_HEADER_LEN)?;
        let start = self.buf.len();
        self.buf.put_u16(code);
        self.buf.put_u16(0);
        Ok(OptionMark { start })
    }

    /// Patch the length of an option opened with [`begin_option`](Self::begin_option).
    /// An option that grew past 65535 bytes is removed again.
    pub fn end_option(&mut self, mark: OptionMark) -> Result<(), NoSpace> {
        let len = self.buf.len() - mark.body_offset();
        let Ok(len) = u16::try_from(len) else {
            self.buf.truncate(mark.start);
            return Err(NoSpace);
        };
        self.buf[mark.start + 2..mark.start + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    /// Drop an option opened with [`begin_option`](Self::begin_option)
    /// together with everything written after it.
    pub fn discard(&mut self, mark: OptionMark) {
        self.buf.truncate(mark.start);
    }

    pub fn patch_u8(&mut self, offset: usize, value: u8) {
        self.buf[offset] = value;
    }

    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Roll back to an earlier length.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}
