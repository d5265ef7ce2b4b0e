use std::time::Duration;

use sha2::Digest as _;

pub mod stream;

pub use stream::{FramedReader, FramedStream, FramedWriter, StreamError};

/// Stream protocol for the file-share wire grammar.
pub static FILE_SHARE_PROTOCOL: &str = "/orcanet/p2p/seawolf/fileshare";

/// Stream protocol for the chat wire grammar.
pub static CHAT_PROTOCOL: &str = "/orcanet/p2p/seawolf/chat";

/// Stream protocol for peer announcements (a single JSON line of known peers).
pub static PEER_EXCHANGE_PROTOCOL: &str = "/orcanet/p2p";

/// Prefix applied to every opaque key stored in or fetched from the DHT.
pub static DHT_KEY_NAMESPACE: &str = "/orcanet/";

/// Size of a single data chunk on the wire and on disk.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Upper bound on the number of CIDs served to a single `DISCOVER` request.
pub const DISCOVER_MAX_ITEMS: usize = 1000;

/// Timeout for each line of a `WANT HAVE`, `DISCOVER`, `PAUSE` or `RESUME` exchange.
pub const WANT_HAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for each line of a `WANT META` or `WANT DATA` exchange.
pub const WANT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a DHT provider lookup.
pub const FIND_PROVIDERS_TIMEOUT: Duration = Duration::from_secs(1);

/// Deadline for opening a file-share stream to a peer, connection setup included.
pub const OPEN_STREAM_TIMEOUT: Duration = Duration::from_secs(1);

/// Idle timeout of the file-share verb loop.
pub const FILE_SHARE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle timeout of a chat room's reader.
pub const CHAT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for the chat handshake frames.
pub const CHAT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Multicodec for raw (unstructured) block data.
const RAW_CODEC: u64 = 0x55;

/// Multihash code for SHA2-256.
const SHA2_256_CODE: u64 = 0x12;

/// Fixed prefix of the marshalled file-metadata wire form:
/// 8 bytes size, 8 bytes price, 1 byte name length.
pub const FILE_META_FIXED_LEN: usize = 17;

/// Errors produced by the fixed wire formats.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// A metadata name must be 1..=255 bytes.
    #[error("file name length {0} is outside 1..=255 bytes")]
    NameLength(usize),

    /// The buffer length does not match the length its own fields declare.
    #[error("metadata buffer length {0} does not match the declared length")]
    LengthMismatch(usize),

    /// The name bytes are not valid UTF-8.
    #[error("file name is not valid UTF-8")]
    NameEncoding,
}

/// Per-provider metadata for a shared file. The name and price are advertised
/// alongside the content, never part of its identity.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct FileMeta {
    pub size: u64,
    pub price: f64,
    pub name: String,
}

impl FileMeta {
    /// Marshal to the wire form: `size(8, BE) price(8, IEEE-754 BE) name_len(1) name`.
    ///
    /// # Errors
    /// Fails if the name is empty or longer than 255 bytes.
    pub fn marshal(&self) -> Result<Vec<u8>, WireError> {
        let name = self.name.as_bytes();
        if name.is_empty() || name.len() > usize::from(u8::MAX) {
            return Err(WireError::NameLength(name.len()));
        }

        let mut bytes = Vec::with_capacity(FILE_META_FIXED_LEN + name.len());
        bytes.extend_from_slice(&self.size.to_be_bytes());
        bytes.extend_from_slice(&self.price.to_be_bytes());
        bytes.push(name.len() as u8);
        bytes.extend_from_slice(name);
        Ok(bytes)
    }

    /// Unmarshal from the wire form.
    ///
    /// # Errors
    /// Fails unless the buffer length is exactly `17 + name_len` with a
    /// non-zero name length, and the name is UTF-8.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < FILE_META_FIXED_LEN {
            return Err(WireError::LengthMismatch(bytes.len()));
        }

        let size = u64::from_be_bytes(bytes[0..8].try_into().expect("slice is 8 bytes"));
        let price = f64::from_be_bytes(bytes[8..16].try_into().expect("slice is 8 bytes"));
        let name_len = usize::from(bytes[16]);
        if name_len == 0 || bytes.len() != FILE_META_FIXED_LEN + name_len {
            return Err(WireError::LengthMismatch(bytes.len()));
        }

        let name = std::str::from_utf8(&bytes[FILE_META_FIXED_LEN..])
            .map_err(|_| WireError::NameEncoding)?
            .to_owned();
        Ok(Self { size, price, name })
    }
}

/// Incremental content-id computation over bytes in stream order.
///
/// Produces a CIDv1 with the raw codec over a SHA2-256 multihash, whose
/// canonical string form is lowercase base32.
#[derive(Default)]
pub struct CidHasher {
    hasher: sha2::Sha256,
    bytes_hashed: u64,
}

impl CidHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.bytes_hashed += bytes.len() as u64;
    }

    /// Number of bytes fed so far.
    #[must_use]
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    #[must_use]
    pub fn finalize(self) -> cid::Cid {
        cid_from_digest(&self.hasher.finalize())
    }
}

/// Content id of a byte slice. Identical content always yields the same CID.
#[must_use]
pub fn cid_for_bytes(bytes: &[u8]) -> cid::Cid {
    let mut hasher = CidHasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn cid_from_digest(digest: &[u8]) -> cid::Cid {
    let hash = multihash::Multihash::<64>::wrap(SHA2_256_CODE, digest)
        .expect("a SHA2-256 digest fits a 64-byte multihash");
    cid::Cid::new_v1(RAW_CODEC, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_round_trip() {
        let meta = FileMeta {
            size: 13,
            price: 0.01,
            name: "hello.txt".to_owned(),
        };
        let bytes = meta.marshal().expect("name is within bounds");
        assert_eq!(bytes.len(), FILE_META_FIXED_LEN + meta.name.len());
        assert_eq!(FileMeta::unmarshal(&bytes).expect("marshalled form"), meta);
    }

    #[test]
    fn meta_rejects_bad_names() {
        let empty = FileMeta {
            size: 0,
            price: 0.0,
            name: String::new(),
        };
        assert!(matches!(empty.marshal(), Err(WireError::NameLength(0))));

        let long = FileMeta {
            size: 0,
            price: 0.0,
            name: "x".repeat(256),
        };
        assert!(matches!(long.marshal(), Err(WireError::NameLength(256))));
    }

    #[test]
    fn meta_rejects_length_mismatch() {
        let meta = FileMeta {
            size: 4,
            price: 1.5,
            name: "f".to_owned(),
        };
        let mut bytes = meta.marshal().expect("name is within bounds");

        // Truncated buffer.
        assert!(FileMeta::unmarshal(&bytes[..bytes.len() - 1]).is_err());

        // Trailing garbage.
        bytes.push(0);
        assert!(FileMeta::unmarshal(&bytes).is_err());

        // Zero-length name.
        let mut zero = meta.marshal().expect("name is within bounds");
        zero[16] = 0;
        zero.truncate(FILE_META_FIXED_LEN);
        assert!(FileMeta::unmarshal(&zero).is_err());
    }

    #[test]
    fn cid_is_deterministic_and_raw_v1() {
        let bytes = b"hello, world\n";
        let first = cid_for_bytes(bytes);
        let second = cid_for_bytes(bytes);
        assert_eq!(first, second);
        assert_eq!(first.version(), cid::Version::V1);
        assert_eq!(first.codec(), RAW_CODEC);

        // CIDv1-raw with SHA2-256 always renders with this base32 prefix.
        assert!(first.to_string().starts_with("bafkrei"));

        // Content identity, not name identity.
        assert_ne!(first, cid_for_bytes(b"hello, world"));
    }

    #[test]
    fn cid_hasher_matches_one_shot() {
        let mut hasher = CidHasher::new();
        hasher.update(b"hello, ");
        hasher.update(b"world\n");
        assert_eq!(hasher.bytes_hashed(), 13);
        assert_eq!(hasher.finalize(), cid_for_bytes(b"hello, world\n"));
    }
}
