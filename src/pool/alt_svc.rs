//! Alt-Svc header parsing and the QUIC preemptive cache for HTTP/3 discovery.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Default freshness of an alternative when the header carries no `ma`.
pub const DEFAULT_MAX_AGE: u64 = 86400;

/// Origin or alternative authority: (host, port).
pub type Authority = (String, u16);

/// Parsed Alt-Svc entry (RFC 7838)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSvcEntry {
    /// Protocol identifier (e.g., "h3", "h3-29", "h2")
    pub protocol: String,
    /// Alternative host; empty means same host
    pub host: String,
    /// Alternative port
    pub port: u16,
    /// Max age in seconds
    pub max_age: u64,
    /// Persist across network changes (persist parameter)
    pub persist: bool,
}

impl AltSvcEntry {
    /// Final HTTP/3 only; draft identifiers such as `h3-29` do not count.
    pub fn is_h3(&self) -> bool {
        self.protocol == "h3"
    }

    /// Whether the alternative stays on the origin host.
    pub fn same_host(&self, host: &str) -> bool {
        self.host.is_empty() || self.host.eq_ignore_ascii_case(host)
    }
}

/// Remembers which origins announced HTTP/3, so the next connection to them
/// can skip TCP and go straight to QUIC.
///
/// Shared between connections; implementations synchronize internally.
pub trait QuicPreemptiveCache: Send + Sync {
    /// Alternative authority recorded for `origin`, if still fresh.
    fn get(&self, origin: &Authority) -> Option<Authority>;

    /// Record that `origin` serves HTTP/3 at `alt_authority`.
    fn insert(&self, origin: Authority, alt_authority: Authority);

    fn remove(&self, origin: &Authority);
}

#[derive(Debug, Clone)]
struct CachedAlternative {
    authority: Authority,
    expires_at: Instant,
}

/// In-memory [`QuicPreemptiveCache`] with per-entry expiry.
#[derive(Debug)]
pub struct AltSvcCache {
    entries: RwLock<HashMap<Authority, CachedAlternative>>,
    max_age: Duration,
}

impl Default for AltSvcCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AltSvcCache {
    pub fn new() -> Self {
        Self::with_max_age(Duration::from_secs(DEFAULT_MAX_AGE))
    }

    /// Cache whose entries stay fresh for `max_age`.
    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_age,
        }
    }

    /// Record the first acceptable `h3` alternative of an Alt-Svc header
    /// for `origin`. `clear` forgets the origin.
    pub fn parse_and_store(&self, origin: Authority, header: &str) -> Option<Authority> {
        if header.trim() == "clear" {
            self.remove(&origin);
            return None;
        }

        let entry = parse_alt_svc(header, DEFAULT_MAX_AGE)
            .into_iter()
            .find(|e| e.is_h3() && e.same_host(&origin.0))?;
        let alt = (entry.host, entry.port);
        let max_age = Duration::from_secs(entry.max_age).min(self.max_age);
        self.store(origin, alt.clone(), max_age);
        Some(alt)
    }

    fn store(&self, origin: Authority, authority: Authority, max_age: Duration) {
        self.write().insert(
            origin,
            CachedAlternative {
                authority,
                expires_at: Instant::now() + max_age,
            },
        );
    }

    /// Remove expired entries from cache
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.write().retain(|_, alt| alt.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Every update is one map call, so a poisoned map is still whole.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Authority, CachedAlternative>> {
        self.entries.read().unwrap_or_else(|poisoned| {
            tracing::warn!("alt-svc cache lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Authority, CachedAlternative>> {
        self.entries.write().unwrap_or_else(|poisoned| {
            tracing::warn!("alt-svc cache lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl QuicPreemptiveCache for AltSvcCache {
    fn get(&self, origin: &Authority) -> Option<Authority> {
        self.read()
            .get(origin)
            .filter(|alt| alt.expires_at > Instant::now())
            .map(|alt| alt.authority.clone())
    }

    fn insert(&self, origin: Authority, alt_authority: Authority) {
        self.store(origin, alt_authority, self.max_age);
    }

    fn remove(&self, origin: &Authority) {
        self.write().remove(origin);
    }
}

/// Parse Alt-Svc header value into a vector of entries
///
/// Malformed alternatives are skipped.
///
/// # Examples
///
/// ```
/// use trident::pool::alt_svc::parse_alt_svc;
///
/// let header = r#"h3=":443"; ma=86400, h3-29="alt.com:8443"; persist=1"#;
/// let entries = parse_alt_svc(header, 3600);
/// assert_eq!(entries.len(), 2);
/// assert_eq!(entries[0].host, "");
/// assert_eq!(entries[1].port, 8443);
/// ```
pub fn parse_alt_svc(header: &str, default_max_age: u64) -> Vec<AltSvcEntry> {
    let mut entries = Vec::new();

    for alt in split_unquoted(header, ',') {
        let alt = alt.trim();
        if alt.is_empty() || alt == "clear" {
            continue;
        }

        let mut parts = split_unquoted(alt, ';').into_iter();
        let main_part = parts.next().unwrap_or_default().trim();

        let Some((protocol, value_part)) = main_part.split_once('=') else {
            tracing::warn!(alternative = alt, "skipping malformed Alt-Svc entry");
            continue;
        };
        let protocol = protocol.trim();
        if protocol.is_empty() {
            tracing::warn!(alternative = alt, "skipping Alt-Svc entry without protocol");
            continue;
        }

        let Some((host, port)) = parse_quoted_value(value_part) else {
            tracing::warn!(alternative = alt, "skipping Alt-Svc entry with invalid authority");
            continue;
        };

        let mut max_age = default_max_age;
        let mut persist = false;
        for param in parts {
            let Some((key, value)) = param.trim().split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "ma" => {
                    if let Ok(age) = value.parse::<u64>() {
                        max_age = age;
                    }
                }
                "persist" => persist = value == "1",
                _ => {}
            }
        }

        entries.push(AltSvcEntry {
            protocol: protocol.to_string(),
            host,
            port,
            max_age,
            persist,
        });
    }

    entries
}

/// Split on `sep` outside of double quotes.
fn split_unquoted(input: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c == sep && !quoted => {
                out.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    out.push(&input[start..]);
    out
}

/// Parse quoted value to extract host and port
///
/// Handles formats:
/// - `":443"` -> ("", 443)
/// - `"alt.example.com:443"` -> ("alt.example.com", 443)
/// - `"[::1]:443"` -> ("::1", 443)
fn parse_quoted_value(value: &str) -> Option<(String, u16)> {
    let value = value.trim();
    let unquoted = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .trim();

    let (host, port) = unquoted.rsplit_once(':')?;
    let port = port.trim().parse::<u16>().ok().filter(|p| *p != 0)?;
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some((host.to_string(), port))
}
