//! Mirror protocol message definitions.
//!
//! This module defines the request records a client sends to a mirror, the
//! envelopes that carry them, and [`MirrorAddr`], the shareable record that
//! names a mirror. All records use the compact encoding from
//! [`crate::encoding`] and must stay byte-compatible with older peers.

use std::fmt;
use std::net::SocketAddrV4;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::{Key, Keyed};
use crate::encoding::{DecodeError, Decoder, Encoder};

// ============================================================================
// add-core
// ============================================================================

const FLAG_REFERRER: u64 = 1;
const FLAG_AUTOBASE: u64 = 2;
const FLAG_AUTOBASE_BLOCK_KEY: u64 = 4;
const FLAG_PRIORITY: u64 = 8;
const FLAG_ANNOUNCE: u64 = 16;

/// Ask a mirror to replicate and persist a core.
///
/// A record carrying only `key` encodes to `00 ‖ key`, the same bytes the
/// first protocol revision produced, so old mirrors keep decoding it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AddCoreRequest {
    /// The core to mirror.
    pub key: Key,
    /// The logical group the core belongs to, e.g. its autobase.
    pub referrer: Option<Key>,
    /// Higher values are served first by the mirror.
    pub priority: u64,
    /// Whether the mirror should announce the core on the DHT.
    pub announce: bool,
    /// Autobase system core key, only read by older mirrors.
    pub deprecated_autobase: Option<Key>,
    /// Block encryption key for `deprecated_autobase`.
    pub deprecated_autobase_block_key: Option<Key>,
}

impl AddCoreRequest {
    /// A record for `key` with every optional field unset.
    pub fn new(key: Key) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    /// Encode as an `add-core` payload. A key-only record produces the
    /// legacy minimal encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0;
        if self.referrer.is_some() {
            flags |= FLAG_REFERRER;
        }
        if self.deprecated_autobase.is_some() {
            flags |= FLAG_AUTOBASE;
            if self.deprecated_autobase_block_key.is_some() {
                flags |= FLAG_AUTOBASE_BLOCK_KEY;
            }
        }
        if self.priority != 0 {
            flags |= FLAG_PRIORITY;
        }
        if self.announce {
            flags |= FLAG_ANNOUNCE;
        }

        let mut enc = Encoder::new();
        enc.uint(flags).fixed32(&self.key);
        if let Some(referrer) = &self.referrer {
            enc.fixed32(referrer);
        }
        if let Some(autobase) = &self.deprecated_autobase {
            enc.fixed32(autobase);
            if let Some(block_key) = &self.deprecated_autobase_block_key {
                enc.fixed32(block_key);
            }
        }
        if self.priority != 0 {
            enc.uint(self.priority);
        }
        enc.finish()
    }

    /// Decode a record. Trailing bytes are ignored so newer peers can append
    /// fields.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(buf);
        let flags = dec.uint()?;
        if flags & FLAG_AUTOBASE_BLOCK_KEY != 0 && flags & FLAG_AUTOBASE == 0 {
            return Err(DecodeError::InvalidFlags(flags));
        }

        let key = dec.fixed32()?;
        let referrer = if flags & FLAG_REFERRER != 0 {
            Some(dec.fixed32()?)
        } else {
            None
        };
        let (deprecated_autobase, deprecated_autobase_block_key) = if flags & FLAG_AUTOBASE != 0 {
            let autobase = dec.fixed32()?;
            let block_key = if flags & FLAG_AUTOBASE_BLOCK_KEY != 0 {
                Some(dec.fixed32()?)
            } else {
                None
            };
            (Some(autobase), block_key)
        } else {
            (None, None)
        };
        let priority = if flags & FLAG_PRIORITY != 0 {
            dec.uint()?
        } else {
            0
        };

        Ok(Self {
            key,
            referrer,
            priority,
            announce: flags & FLAG_ANNOUNCE != 0,
            deprecated_autobase,
            deprecated_autobase_block_key,
        })
    }
}

// ============================================================================
// delete-core / post-to-mailbox
// ============================================================================

/// Ask a mirror to drop a core it holds for us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteCoreRequest {
    pub key: Key,
}

impl DeleteCoreRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.fixed32(&self.key);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(buf);
        Ok(Self {
            key: dec.fixed32()?,
        })
    }
}

/// Drop an opaque message into a mailbox hosted by the mirror.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxRequest {
    pub mailbox: Vec<u8>,
    pub message: Vec<u8>,
}

impl MailboxRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.bytes(&self.mailbox).bytes(&self.message);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(buf);
        let mailbox = dec.bytes()?.to_vec();
        let message = dec.bytes()?.to_vec();
        Ok(Self { mailbox, message })
    }
}

// ============================================================================
// Methods and envelopes
// ============================================================================

/// RPC method names understood by a mirror.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    AddCore,
    DeleteCore,
    PostToMailbox,
}

impl Method {
    /// Wire name of the method.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::AddCore => "add-core",
            Method::DeleteCore => "delete-core",
            Method::PostToMailbox => "post-to-mailbox",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add-core" => Ok(Method::AddCore),
            "delete-core" => Ok(Method::DeleteCore),
            "post-to-mailbox" => Ok(Method::PostToMailbox),
            other => Err(DecodeError::UnknownMethod(other.to_string())),
        }
    }
}

/// A typed request, as dispatched by the mirror side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MirrorRequest {
    AddCore(AddCoreRequest),
    DeleteCore(DeleteCoreRequest),
    PostToMailbox(MailboxRequest),
}

impl MirrorRequest {
    pub fn method(&self) -> Method {
        match self {
            MirrorRequest::AddCore(_) => Method::AddCore,
            MirrorRequest::DeleteCore(_) => Method::DeleteCore,
            MirrorRequest::PostToMailbox(_) => Method::PostToMailbox,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            MirrorRequest::AddCore(req) => req.encode(),
            MirrorRequest::DeleteCore(req) => req.encode(),
            MirrorRequest::PostToMailbox(req) => req.encode(),
        }
    }

    pub fn decode(method: Method, payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(match method {
            Method::AddCore => MirrorRequest::AddCore(AddCoreRequest::decode(payload)?),
            Method::DeleteCore => MirrorRequest::DeleteCore(DeleteCoreRequest::decode(payload)?),
            Method::PostToMailbox => MirrorRequest::PostToMailbox(MailboxRequest::decode(payload)?),
        })
    }
}

/// One request on the wire: method name followed by the encoded payload.
pub fn encode_request(method: Method, payload: &[u8]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.string(method.as_str()).bytes(payload);
    enc.finish()
}

/// Split a request frame into its method and payload.
pub fn decode_request(buf: &[u8]) -> Result<(Method, Vec<u8>), DecodeError> {
    let mut dec = Decoder::new(buf);
    let method = dec.string()?.parse()?;
    let payload = dec.bytes()?.to_vec();
    dec.finish()?;
    Ok((method, payload))
}

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

/// A mirror's answer to one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ok(Vec<u8>),
    Error(String),
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            Response::Ok(payload) => enc.u8(STATUS_OK).bytes(payload),
            Response::Error(message) => enc.u8(STATUS_ERROR).string(message),
        };
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(buf);
        let response = match dec.u8()? {
            STATUS_OK => Response::Ok(dec.bytes()?.to_vec()),
            STATUS_ERROR => Response::Error(dec.string()?.to_string()),
            other => return Err(DecodeError::UnknownStatus(other)),
        };
        dec.finish()?;
        Ok(response)
    }
}

// ============================================================================
// Mirror address record
// ============================================================================

const FLAG_NODES: u64 = 1;

/// A mirror's public key plus optional IPv4 hints for reaching it.
///
/// The encoding starts with the raw key so a record can be handed to code
/// that only understands bare 32-byte keys. A bare key, or a key followed
/// by a zero flags byte, decodes with `nodes = None`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MirrorAddr {
    pub key: Key,
    pub nodes: Option<Vec<SocketAddrV4>>,
}

impl MirrorAddr {
    /// An address with no direct node hints.
    pub fn from_key(key: Key) -> Self {
        Self { key, nodes: None }
    }

    /// Socket hints, empty when none were given.
    pub fn hints(&self) -> &[SocketAddrV4] {
        self.nodes.as_deref().unwrap_or(&[])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.fixed32(&self.key);
        match &self.nodes {
            Some(nodes) => {
                enc.uint(FLAG_NODES).uint(nodes.len() as u64);
                for node in nodes {
                    enc.ipv4(*node.ip(), node.port());
                }
            }
            None => {
                enc.uint(0);
            }
        }
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(buf);
        let key = dec.fixed32()?;
        if dec.is_empty() {
            return Ok(Self::from_key(key));
        }

        let flags = dec.uint()?;
        let nodes = if flags & FLAG_NODES != 0 {
            let count = dec.length()?;
            let mut nodes = Vec::with_capacity(count.min(dec.remaining() / 6));
            for _ in 0..count {
                let (host, port) = dec.ipv4()?;
                nodes.push(SocketAddrV4::new(host, port));
            }
            Some(nodes)
        } else {
            None
        };
        Ok(Self { key, nodes })
    }
}

impl Keyed for MirrorAddr {
    fn key(&self) -> &Key {
        &self.key
    }
}

impl From<Key> for MirrorAddr {
    fn from(key: Key) -> Self {
        Self::from_key(key)
    }
}

impl fmt::Display for MirrorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.encode()))
    }
}

impl FromStr for MirrorAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        Ok(Self::decode(&bytes)?)
    }
}

impl TryFrom<String> for MirrorAddr {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MirrorAddr> for String {
    fn from(addr: MirrorAddr) -> Self {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn localhost(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn secret_key() -> Key {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = b"secret"[i % 6];
        }
        key
    }

    #[test]
    fn add_core_key_only_matches_legacy_encoding() {
        let key = [7u8; 32];
        let encoded = AddCoreRequest::new(key).encode();

        let mut legacy = vec![0u8];
        legacy.extend_from_slice(&key);
        assert_eq!(encoded, legacy);

        let decoded = AddCoreRequest::decode(&legacy).expect("legacy decodes");
        assert_eq!(decoded.key, key);
        assert_eq!(decoded.referrer, None);
        assert_eq!(decoded.priority, 0);
        assert!(!decoded.announce);
    }

    #[test]
    fn add_core_carries_all_fields() {
        let request = AddCoreRequest {
            key: [1u8; 32],
            referrer: Some([2u8; 32]),
            priority: 300,
            announce: true,
            deprecated_autobase: Some([3u8; 32]),
            deprecated_autobase_block_key: Some([4u8; 32]),
        };
        let encoded = request.encode();
        assert_eq!(encoded[0], 1 | 2 | 4 | 8 | 16);
        assert_eq!(AddCoreRequest::decode(&encoded), Ok(request));
    }

    #[test]
    fn add_core_rejects_block_key_without_autobase() {
        let mut buf = vec![4u8];
        buf.extend_from_slice(&[0u8; 64]);
        assert_eq!(
            AddCoreRequest::decode(&buf),
            Err(DecodeError::InvalidFlags(4))
        );
    }

    #[test]
    fn mirror_addr_matches_reference_vectors() {
        let key = secret_key();
        let empty = MirrorAddr {
            key,
            nodes: Some(Vec::new()),
        };
        assert_eq!(
            hex::encode(empty.encode()),
            "73656372657473656372657473656372657473656372657473656372657473650100"
        );

        let with_nodes = MirrorAddr {
            key,
            nodes: Some(vec![localhost(30000), localhost(30001), localhost(30002)]),
        };
        let encoded = with_nodes.encode();
        assert_eq!(
            hex::encode(&encoded),
            "736563726574736563726574736563726574736563726574736563726574736501037f00000130757f00000131757f0000013275"
        );
        assert_eq!(&encoded[..32], &key[..]);
        assert_eq!(MirrorAddr::decode(&encoded), Ok(with_nodes));
    }

    #[test]
    fn mirror_addr_decodes_old_keys() {
        let key = secret_key();
        let mut old = key.to_vec();
        old.push(0);
        assert_eq!(MirrorAddr::decode(&old), Ok(MirrorAddr::from_key(key)));
        assert_eq!(MirrorAddr::decode(&key), Ok(MirrorAddr::from_key(key)));
    }

    #[test]
    fn mirror_addr_parses_from_hex() {
        let key = secret_key();
        let addr: MirrorAddr = hex::encode(key).parse().expect("bare key parses");
        assert_eq!(addr, MirrorAddr::from_key(key));
        assert!("zz".parse::<MirrorAddr>().is_err());
    }

    #[test]
    fn request_envelope_round_trips_method() {
        let payload = DeleteCoreRequest { key: [9u8; 32] }.encode();
        let frame = encode_request(Method::DeleteCore, &payload);
        let (method, body) = decode_request(&frame).expect("decodes");
        assert_eq!(method, Method::DeleteCore);
        assert_eq!(
            MirrorRequest::decode(method, &body),
            Ok(MirrorRequest::DeleteCore(DeleteCoreRequest { key: [9u8; 32] }))
        );

        let bogus = {
            let mut enc = Encoder::new();
            enc.string("drop-table").bytes(&[]);
            enc.finish()
        };
        assert_eq!(
            decode_request(&bogus),
            Err(DecodeError::UnknownMethod("drop-table".into()))
        );
    }

    #[test]
    fn response_distinguishes_errors() {
        let err = Response::Error("not trusted".into());
        assert_eq!(Response::decode(&err.encode()), Ok(err));
        assert_eq!(
            Response::decode(&[9]),
            Err(DecodeError::UnknownStatus(9))
        );
    }
}
