//! P2P protocol messages.
//!
//! Payload encoding follows the Bitcoin wire conventions: little-endian
//! integers (ports excepted), varint length prefixes, and hashes in raw wire
//! order. Decoding is strict about truncation and varint canonicality; a
//! malformed payload is fatal to the connection that produced it.

use crate::{NetworkError, NetworkResult};
use bytes::{Buf, BufMut, BytesMut};
use spv_chain::{BlockHeader, Hash, HEADER_WIRE_SIZE};
use std::net::{IpAddr, SocketAddr};

/// Size of the NUL-padded command field in the frame header.
pub const COMMAND_SIZE: usize = 12;

/// Maximum entries accepted in an `addr` message.
pub const MAX_ADDR_ENTRIES: usize = 1000;

/// Maximum entries accepted in a `headers` message.
pub const MAX_HEADERS_ENTRIES: usize = 2000;

/// Maximum entries accepted in `inv` / `getdata` messages.
pub const MAX_INV_ENTRIES: usize = 50_000;

/// Maximum hashes accepted in a block locator.
pub const MAX_LOCATOR_ENTRIES: usize = 101;

/// Maximum length of a var-string (user agents, reject reasons).
pub const MAX_VAR_STR: usize = 256;

/// IPv4-mapped IPv6 prefix (`::ffff:0:0/96`).
const V4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

fn truncated(what: &str) -> NetworkError {
    NetworkError::InvalidMessage(format!("truncated {}", what))
}

fn need(buf: &&[u8], n: usize, what: &str) -> NetworkResult<()> {
    if buf.remaining() < n {
        Err(truncated(what))
    } else {
        Ok(())
    }
}

/// Encode a varint in its canonical (shortest) form.
pub fn write_varint(buf: &mut BytesMut, value: u64) {
    if value < 0xfd {
        buf.put_u8(value as u8);
    } else if value <= 0xffff {
        buf.put_u8(0xfd);
        buf.put_u16_le(value as u16);
    } else if value <= 0xffff_ffff {
        buf.put_u8(0xfe);
        buf.put_u32_le(value as u32);
    } else {
        buf.put_u8(0xff);
        buf.put_u64_le(value);
    }
}

/// Decode a varint, rejecting non-canonical encodings.
pub fn read_varint(buf: &mut &[u8]) -> NetworkResult<u64> {
    need(buf, 1, "varint")?;
    match buf.get_u8() {
        n @ 0x00..=0xfc => Ok(n as u64),
        0xfd => {
            need(buf, 2, "varint")?;
            let v = buf.get_u16_le() as u64;
            if v < 0xfd {
                return Err(NetworkError::InvalidMessage(
                    "non-canonical varint".to_string(),
                ));
            }
            Ok(v)
        }
        0xfe => {
            need(buf, 4, "varint")?;
            let v = buf.get_u32_le() as u64;
            if v <= 0xffff {
                return Err(NetworkError::InvalidMessage(
                    "non-canonical varint".to_string(),
                ));
            }
            Ok(v)
        }
        0xff => {
            need(buf, 8, "varint")?;
            let v = buf.get_u64_le();
            if v <= 0xffff_ffff {
                return Err(NetworkError::InvalidMessage(
                    "non-canonical varint".to_string(),
                ));
            }
            Ok(v)
        }
    }
}

fn write_var_str(buf: &mut BytesMut, s: &str) {
    write_varint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

fn read_var_str(buf: &mut &[u8]) -> NetworkResult<String> {
    let len = read_varint(buf)? as usize;
    if len > MAX_VAR_STR {
        return Err(NetworkError::InvalidMessage(format!(
            "var-string too long: {}",
            len
        )));
    }
    need(buf, len, "var-string")?;
    let s = String::from_utf8_lossy(&buf[..len]).into_owned();
    buf.advance(len);
    Ok(s)
}

fn write_hash(buf: &mut BytesMut, hash: &Hash) {
    buf.put_slice(hash.as_bytes());
}

fn read_hash(buf: &mut &[u8]) -> NetworkResult<Hash> {
    need(buf, 32, "hash")?;
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&buf[..32]);
    buf.advance(32);
    Ok(Hash::from_bytes(bytes))
}

/// Write the 16-byte IPv6-shaped address plus a big-endian port.
fn write_socket_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_slice(&V4_MAPPED_PREFIX);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
    }
    buf.put_u16(addr.port());
}

fn read_socket_addr(buf: &mut &[u8]) -> NetworkResult<SocketAddr> {
    need(buf, 18, "address")?;
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buf[..16]);
    buf.advance(16);
    let port = buf.get_u16();
    let ip = if octets[..12] == V4_MAPPED_PREFIX {
        IpAddr::from([octets[12], octets[13], octets[14], octets[15]])
    } else {
        IpAddr::from(octets)
    };
    Ok(SocketAddr::new(ip, port))
}

/// Network address as carried in the `version` message (no timestamp).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionNetAddr {
    /// Service bitmap advertised for the address.
    pub services: u64,
    /// IP and port.
    pub addr: SocketAddr,
}

impl VersionNetAddr {
    /// An unroutable placeholder, used as the sender field by a
    /// non-listening client.
    pub fn unspecified() -> Self {
        Self {
            services: 0,
            addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.services);
        write_socket_addr(buf, &self.addr);
    }

    fn read(buf: &mut &[u8]) -> NetworkResult<Self> {
        need(buf, 8, "net address")?;
        let services = buf.get_u64_le();
        let addr = read_socket_addr(buf)?;
        Ok(Self { services, addr })
    }
}

/// Network address as carried in `addr` messages and the peer book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddr {
    /// Last-seen time, seconds since the epoch.
    pub time: u32,
    /// Service bitmap advertised for the address.
    pub services: u64,
    /// IP and port.
    pub addr: SocketAddr,
}

impl NetAddr {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.time);
        buf.put_u64_le(self.services);
        write_socket_addr(buf, &self.addr);
    }

    fn read(buf: &mut &[u8]) -> NetworkResult<Self> {
        need(buf, 12, "addr entry")?;
        let time = buf.get_u32_le();
        let services = buf.get_u64_le();
        let addr = read_socket_addr(buf)?;
        Ok(Self {
            time,
            services,
            addr,
        })
    }
}

/// Inventory object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InvType {
    /// Transaction.
    Tx = 1,
    /// Full block.
    Block = 2,
    /// Filtered block (BIP 37).
    FilteredBlock = 3,
}

impl TryFrom<u32> for InvType {
    type Error = NetworkError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(InvType::Tx),
            2 => Ok(InvType::Block),
            3 => Ok(InvType::FilteredBlock),
            other => Err(NetworkError::InvalidMessage(format!(
                "unknown inventory type: {}",
                other
            ))),
        }
    }
}

/// A single inventory announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inv {
    /// Object type.
    pub inv_type: InvType,
    /// Object hash.
    pub hash: Hash,
}

impl Inv {
    /// Announcement of a block by hash.
    pub fn block(hash: Hash) -> Self {
        Inv {
            inv_type: InvType::Block,
            hash,
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.inv_type as u32);
        write_hash(buf, &self.hash);
    }

    fn read(buf: &mut &[u8]) -> NetworkResult<Self> {
        need(buf, 4, "inv entry")?;
        let inv_type = InvType::try_from(buf.get_u32_le())?;
        let hash = read_hash(buf)?;
        Ok(Inv { inv_type, hash })
    }
}

/// The `version` handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    /// Protocol version.
    pub version: i32,
    /// Our service bitmap.
    pub services: u64,
    /// Sender wall-clock time.
    pub timestamp: i64,
    /// Address the message is sent to, as we see it.
    pub receiver: VersionNetAddr,
    /// Our own address; unroutable for a non-listening client.
    pub sender: VersionNetAddr,
    /// Random nonce for self-connection detection.
    pub nonce: u64,
    /// Free-form user agent.
    pub user_agent: String,
    /// Best block height at send time.
    pub start_height: i32,
    /// Whether the peer should relay transactions to us.
    pub relay: bool,
}

impl VersionMessage {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.version);
        buf.put_u64_le(self.services);
        buf.put_i64_le(self.timestamp);
        self.receiver.write(buf);
        self.sender.write(buf);
        buf.put_u64_le(self.nonce);
        write_var_str(buf, &self.user_agent);
        buf.put_i32_le(self.start_height);
        buf.put_u8(self.relay as u8);
    }

    fn read(buf: &mut &[u8]) -> NetworkResult<Self> {
        need(buf, 20, "version")?;
        let version = buf.get_i32_le();
        let services = buf.get_u64_le();
        let timestamp = buf.get_i64_le();
        let receiver = VersionNetAddr::read(buf)?;
        let sender = VersionNetAddr::read(buf)?;
        need(buf, 8, "version nonce")?;
        let nonce = buf.get_u64_le();
        let user_agent = read_var_str(buf)?;
        need(buf, 4, "version height")?;
        let start_height = buf.get_i32_le();
        // Optional since BIP 37; absent means relay everything.
        let relay = if buf.has_remaining() {
            buf.get_u8() != 0
        } else {
            true
        };
        Ok(Self {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// Locator payload shared by `getheaders` and `getblocks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocator {
    /// Protocol version.
    pub version: u32,
    /// Known block hashes, newest first, genesis last.
    pub locator: Vec<Hash>,
    /// Hash to stop at, or zero for as-many-as-possible.
    pub hash_stop: Hash,
}

impl BlockLocator {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.version);
        write_varint(buf, self.locator.len() as u64);
        for hash in &self.locator {
            write_hash(buf, hash);
        }
        write_hash(buf, &self.hash_stop);
    }

    fn read(buf: &mut &[u8]) -> NetworkResult<Self> {
        need(buf, 4, "locator")?;
        let version = buf.get_u32_le();
        let count = read_varint(buf)? as usize;
        if count > MAX_LOCATOR_ENTRIES {
            return Err(NetworkError::InvalidMessage(format!(
                "locator too long: {}",
                count
            )));
        }
        let mut locator = Vec::with_capacity(count);
        for _ in 0..count {
            locator.push(read_hash(buf)?);
        }
        let hash_stop = read_hash(buf)?;
        Ok(Self {
            version,
            locator,
            hash_stop,
        })
    }
}

/// Reject category code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Dust,
    InsufficientFee,
    Checkpoint,
    /// A code this client does not know about.
    Other(u8),
}

impl RejectCode {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => RejectCode::Malformed,
            0x10 => RejectCode::Invalid,
            0x11 => RejectCode::Obsolete,
            0x12 => RejectCode::Duplicate,
            0x40 => RejectCode::Nonstandard,
            0x41 => RejectCode::Dust,
            0x42 => RejectCode::InsufficientFee,
            0x43 => RejectCode::Checkpoint,
            other => RejectCode::Other(other),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::Nonstandard => 0x40,
            RejectCode::Dust => 0x41,
            RejectCode::InsufficientFee => 0x42,
            RejectCode::Checkpoint => 0x43,
            RejectCode::Other(b) => b,
        }
    }
}

/// A peer's `reject` notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    /// Command the rejection refers to.
    pub message: String,
    /// Category code.
    pub code: RejectCode,
    /// Human-readable reason.
    pub reason: String,
    /// Hash of the rejected object, when one applies.
    pub data: Option<Hash>,
}

impl RejectMessage {
    fn write(&self, buf: &mut BytesMut) {
        write_var_str(buf, &self.message);
        buf.put_u8(self.code.to_byte());
        write_var_str(buf, &self.reason);
        if let Some(hash) = &self.data {
            write_hash(buf, hash);
        }
    }

    fn read(buf: &mut &[u8]) -> NetworkResult<Self> {
        let message = read_var_str(buf)?;
        need(buf, 1, "reject code")?;
        let code = RejectCode::from_byte(buf.get_u8());
        let reason = read_var_str(buf)?;
        let data = if buf.remaining() >= 32 {
            Some(read_hash(buf)?)
        } else {
            None
        };
        Ok(Self {
            message,
            code,
            reason,
            data,
        })
    }
}

/// Message command, the 12-byte ASCII field of the frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    GetAddr,
    Addr,
    GetHeaders,
    Headers,
    GetBlocks,
    Inv,
    GetData,
    Mempool,
    SendHeaders,
    Reject,
    /// Command this client does not handle; frame-validated and discarded.
    Unknown(String),
}

impl Command {
    /// Wire name of the command.
    pub fn as_str(&self) -> &str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::GetAddr => "getaddr",
            Command::Addr => "addr",
            Command::GetHeaders => "getheaders",
            Command::Headers => "headers",
            Command::GetBlocks => "getblocks",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::Mempool => "mempool",
            Command::SendHeaders => "sendheaders",
            Command::Reject => "reject",
            Command::Unknown(name) => name,
        }
    }

    /// Parse the NUL-padded command field.
    pub fn from_wire(bytes: &[u8; COMMAND_SIZE]) -> NetworkResult<Self> {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(COMMAND_SIZE);
        if bytes[end..].iter().any(|&b| b != 0) {
            return Err(NetworkError::InvalidMessage(
                "command has bytes after NUL padding".to_string(),
            ));
        }
        let name = &bytes[..end];
        if name.is_empty() || !name.iter().all(|b| b.is_ascii_graphic()) {
            return Err(NetworkError::InvalidMessage(
                "command is not printable ASCII".to_string(),
            ));
        }
        let name = std::str::from_utf8(name)
            .map_err(|_| NetworkError::InvalidMessage("command is not UTF-8".to_string()))?;
        Ok(match name {
            "version" => Command::Version,
            "verack" => Command::Verack,
            "ping" => Command::Ping,
            "pong" => Command::Pong,
            "getaddr" => Command::GetAddr,
            "addr" => Command::Addr,
            "getheaders" => Command::GetHeaders,
            "headers" => Command::Headers,
            "getblocks" => Command::GetBlocks,
            "inv" => Command::Inv,
            "getdata" => Command::GetData,
            "mempool" => Command::Mempool,
            "sendheaders" => Command::SendHeaders,
            "reject" => Command::Reject,
            other => Command::Unknown(other.to_string()),
        })
    }

    /// Serialize as the NUL-padded command field.
    pub fn to_wire(&self) -> [u8; COMMAND_SIZE] {
        let mut field = [0u8; COMMAND_SIZE];
        let name = self.as_str().as_bytes();
        field[..name.len()].copy_from_slice(name);
        field
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetAddr,
    Addr(Vec<NetAddr>),
    GetHeaders(BlockLocator),
    Headers(Vec<BlockHeader>),
    GetBlocks(BlockLocator),
    Inv(Vec<Inv>),
    GetData(Vec<Inv>),
    Mempool,
    SendHeaders,
    Reject(RejectMessage),
    /// Frame-validated but unhandled; payload discarded.
    Unknown { command: String, payload_len: usize },
}

impl Message {
    /// The command this message is framed under.
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::Verack => Command::Verack,
            Message::Ping(_) => Command::Ping,
            Message::Pong(_) => Command::Pong,
            Message::GetAddr => Command::GetAddr,
            Message::Addr(_) => Command::Addr,
            Message::GetHeaders(_) => Command::GetHeaders,
            Message::Headers(_) => Command::Headers,
            Message::GetBlocks(_) => Command::GetBlocks,
            Message::Inv(_) => Command::Inv,
            Message::GetData(_) => Command::GetData,
            Message::Mempool => Command::Mempool,
            Message::SendHeaders => Command::SendHeaders,
            Message::Reject(_) => Command::Reject,
            Message::Unknown { command, .. } => Command::Unknown(command.clone()),
        }
    }

    /// Encode the payload (frame header excluded) into `buf`.
    pub fn encode_payload(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        match self {
            Message::Version(v) => v.write(buf),
            Message::Verack | Message::GetAddr | Message::Mempool | Message::SendHeaders => {}
            Message::Ping(nonce) | Message::Pong(nonce) => buf.put_u64_le(*nonce),
            Message::Addr(entries) => {
                write_varint(buf, entries.len() as u64);
                for entry in entries {
                    entry.write(buf);
                }
            }
            Message::GetHeaders(locator) | Message::GetBlocks(locator) => locator.write(buf),
            Message::Headers(headers) => {
                write_varint(buf, headers.len() as u64);
                for header in headers {
                    buf.put_slice(&header.to_wire_bytes());
                    // Transaction count, always zero in a headers message.
                    write_varint(buf, 0);
                }
            }
            Message::Inv(entries) | Message::GetData(entries) => {
                write_varint(buf, entries.len() as u64);
                for entry in entries {
                    entry.write(buf);
                }
            }
            Message::Reject(reject) => reject.write(buf),
            Message::Unknown { command, .. } => {
                return Err(NetworkError::InvalidMessage(format!(
                    "cannot encode unknown command {:?}",
                    command
                )));
            }
        }
        Ok(())
    }

    /// Decode a payload for a known command.
    pub fn decode_payload(command: &Command, payload: &[u8]) -> NetworkResult<Self> {
        let mut buf = payload;
        let msg = match command {
            Command::Version => Message::Version(VersionMessage::read(&mut buf)?),
            Command::Verack => Message::Verack,
            Command::Ping => {
                need(&buf, 8, "ping nonce")?;
                Message::Ping(buf.get_u64_le())
            }
            Command::Pong => {
                need(&buf, 8, "pong nonce")?;
                Message::Pong(buf.get_u64_le())
            }
            Command::GetAddr => Message::GetAddr,
            Command::Addr => {
                let count = read_varint(&mut buf)? as usize;
                if count > MAX_ADDR_ENTRIES {
                    return Err(NetworkError::InvalidMessage(format!(
                        "addr list too long: {}",
                        count
                    )));
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(NetAddr::read(&mut buf)?);
                }
                Message::Addr(entries)
            }
            Command::GetHeaders => Message::GetHeaders(BlockLocator::read(&mut buf)?),
            Command::GetBlocks => Message::GetBlocks(BlockLocator::read(&mut buf)?),
            Command::Headers => {
                let count = read_varint(&mut buf)? as usize;
                if count > MAX_HEADERS_ENTRIES {
                    return Err(NetworkError::InvalidMessage(format!(
                        "headers list too long: {}",
                        count
                    )));
                }
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    need(&buf, HEADER_WIRE_SIZE, "header")?;
                    let mut wire = [0u8; HEADER_WIRE_SIZE];
                    wire.copy_from_slice(&buf[..HEADER_WIRE_SIZE]);
                    buf.advance(HEADER_WIRE_SIZE);
                    headers.push(BlockHeader::from_wire_bytes(&wire));
                    // Trailing transaction count, zero by convention.
                    read_varint(&mut buf)?;
                }
                Message::Headers(headers)
            }
            Command::Inv | Command::GetData => {
                let count = read_varint(&mut buf)? as usize;
                if count > MAX_INV_ENTRIES {
                    return Err(NetworkError::InvalidMessage(format!(
                        "inv list too long: {}",
                        count
                    )));
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(Inv::read(&mut buf)?);
                }
                if matches!(command, Command::Inv) {
                    Message::Inv(entries)
                } else {
                    Message::GetData(entries)
                }
            }
            Command::Mempool => Message::Mempool,
            Command::SendHeaders => Message::SendHeaders,
            Command::Reject => Message::Reject(RejectMessage::read(&mut buf)?),
            Command::Unknown(name) => Message::Unknown {
                command: name.clone(),
                payload_len: payload.len(),
            },
        };
        Ok(msg)
    }
}
