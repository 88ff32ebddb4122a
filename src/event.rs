//! Core protocol types the engine stores and indexes.
//!
//! These are deliberately independent of any wire-JSON crate: the spec
//! treats the client-facing JSON codec and signature verification as
//! external collaborators, so callers hand the engine already-verified,
//! already-parsed events built from these types.

use std::fmt;

/// 32-byte content-hash identifier of an event.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub [u8; 32]);

/// 32-byte schnorr x-only public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey(pub [u8; 32]);

macro_rules! hex_id_type {
    ($ty:ident) => {
        impl $ty {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                crate::codec::ints::to_hex(&self.0)
            }

            pub fn from_hex(s: &str) -> Option<Self> {
                let bytes = crate::codec::ints::from_hex(s)?;
                if bytes.len() != 32 {
                    return None;
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Some($ty(arr))
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($ty), self.to_hex())
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }
    };
}

hex_id_type!(EventId);
hex_id_type!(PublicKey);

/// A 40-bit monotonic handle assigned to every stored event.
///
/// Only the low 40 bits are ever significant; callers must not rely on the
/// top 24 bits of the backing `u64`.
pub type Serial = u64;

pub const MAX_SERIAL: Serial = (1u64 << 40) - 1;

/// Numeric event kind code.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Kind(pub u16);

impl Kind {
    pub fn is_ephemeral(self) -> bool {
        (20_000..30_000).contains(&self.0)
    }

    pub fn is_replaceable(self) -> bool {
        self.0 == 0 || self.0 == 3 || (10_000..20_000).contains(&self.0)
    }

    pub fn is_parameterized_replaceable(self) -> bool {
        (30_000..40_000).contains(&self.0)
    }

    pub fn is_deletion(self) -> bool {
        self.0 == 5
    }

    pub fn is_regular(self) -> bool {
        !self.is_ephemeral() && !self.is_replaceable() && !self.is_parameterized_replaceable()
    }
}

impl From<u16> for Kind {
    fn from(v: u16) -> Self {
        Kind(v)
    }
}

/// One tag: an ordered list of string fields, first of which is the tag key.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new(fields: Vec<String>) -> Self {
        Tag(fields)
    }

    pub fn key(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(|s| s.as_str())
    }

    /// True iff this tag's key is `key` and its value is in `wanted`.
    pub fn matches_any(&self, key: &str, wanted: &[String]) -> bool {
        self.key() == Some(key) && self.value().map(|v| wanted.iter().any(|w| w == v)).unwrap_or(false)
    }
}

/// Immutable event record.
#[derive(Clone, Debug)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: i64,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: [u8; 64],
}

impl Event {
    /// First value of the first `d` tag, if any.
    pub fn d_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key() == Some("d"))
            .and_then(|t| t.value())
    }

    /// First value of the first `expiration` tag, parsed as a unix timestamp.
    pub fn expiration(&self) -> Option<i64> {
        self.tags
            .iter()
            .find(|t| t.key() == Some("expiration"))
            .and_then(|t| t.value())
            .and_then(|v| v.parse::<i64>().ok())
    }

    /// All values of tags with the given single-letter key.
    pub fn tag_values<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.key() == Some(key))
            .filter_map(|t| t.value())
    }

    /// Whether this event satisfies a caller-visible address string
    /// `kind:pubkey:d_tag`, as used in deletion `a`-tags.
    pub fn address(&self) -> String {
        format!(
            "{}:{}:{}",
            self.kind.0,
            self.pubkey.to_hex(),
            self.d_tag().unwrap_or("")
        )
    }

    /// Whether this event satisfies `kind:pubkey` (no d-tag component),
    /// used for replaceable (non-parameterized) deletion `a`-tags.
    pub fn kind_pubkey(&self) -> String {
        format!("{}:{}", self.kind.0, self.pubkey.to_hex())
    }
}
