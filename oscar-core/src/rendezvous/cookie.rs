//! Eight-byte opaque cookies correlating rendezvous and chat messages.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::buffer::{ByteReader, ByteWriter};
use crate::error::OscarError;

pub const COOKIE_LEN: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Cookie(pub [u8; COOKIE_LEN]);

impl Cookie {
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self, OscarError> {
        Ok(Self(r.read_array::<COOKIE_LEN>()?))
    }

    pub fn write(&self, w: &mut ByteWriter) {
        w.write_bytes(&self.0);
    }

    pub fn as_bytes(&self) -> &[u8; COOKIE_LEN] {
        &self.0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({self})")
    }
}

// ── CookieGenerator ──────────────────────────────────────────────

static GENERATORS: AtomicU64 = AtomicU64::new(0);

/// Session-scoped cookie source: a keyed blake3 hash of a counter.
///
/// The key is derived once per generator, so two sessions in one process
/// draw from unrelated streams.
#[derive(Debug)]
pub struct CookieGenerator {
    key: [u8; 32],
    counter: AtomicU64,
}

impl CookieGenerator {
    pub fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"oscar-cookie");
        hasher.update(&nanos.to_be_bytes());
        hasher.update(&std::process::id().to_be_bytes());
        hasher.update(&GENERATORS.fetch_add(1, Ordering::Relaxed).to_be_bytes());
        Self::with_key(*hasher.finalize().as_bytes())
    }

    /// A deterministic generator, for tests.
    pub fn with_key(key: [u8; 32]) -> Self {
        Self {
            key,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_cookie(&self) -> Cookie {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let hash = blake3::keyed_hash(&self.key, &n.to_be_bytes());
        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(&hash.as_bytes()[..COOKIE_LEN]);
        Cookie(cookie)
    }

    /// Draw cookies until `taken` rejects none.
    pub fn next_unique(&self, taken: impl Fn(&Cookie) -> bool) -> Cookie {
        loop {
            let cookie = self.next_cookie();
            if !taken(&cookie) {
                return cookie;
            }
            tracing::debug!("cookie {cookie} collides with a live negotiation; drawing again");
        }
    }
}

impl Default for CookieGenerator {
    fn default() -> Self {
        Self::new()
    }
}
