// ── Reverse DNS cache ──
//
// Every stored point carries a `dns_name` tag, so each poll cycle would
// otherwise issue one reverse lookup per device. Entries live for a
// fixed TTL; a failed lookup degrades to the IP string, which is cached
// like any other answer.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Blocking reverse resolver.
///
/// Called on the blocking thread pool, never on an async worker.
pub trait HostnameResolver: Send + Sync + 'static {
    fn resolve(&self, ip: &str) -> io::Result<String>;
}

/// Resolver backed by the operating system (`getnameinfo`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl HostnameResolver for SystemResolver {
    fn resolve(&self, ip: &str) -> io::Result<String> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        dns_lookup::lookup_addr(&addr)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    hostname: String,
    stored_at: Instant,
}

/// Cache occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub ttl: Duration,
    pub hits: u64,
    pub misses: u64,
}

/// TTL-bounded IP → hostname cache.
pub struct HostnameCache {
    ttl: Duration,
    resolver: Arc<dyn HostnameResolver>,
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HostnameCache {
    pub fn new(ttl: Duration, resolver: Arc<dyn HostnameResolver>) -> Self {
        Self {
            ttl,
            resolver,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache backed by the system resolver.
    pub fn system(ttl: Duration) -> Self {
        Self::new(ttl, Arc::new(SystemResolver))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Hostname for `ip`, resolving on a miss. Never fails: an
    /// unresolvable address yields the IP string itself.
    pub async fn get_hostname(&self, ip: &str) -> String {
        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(ip) {
                if entry.stored_at.elapsed() < self.ttl {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return entry.hostname.clone();
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let hostname = self.lookup(ip).await;

        self.entries.lock().await.insert(
            ip.to_owned(),
            CacheEntry {
                hostname: hostname.clone(),
                stored_at: Instant::now(),
            },
        );
        hostname
    }

    async fn lookup(&self, ip: &str) -> String {
        let resolver = Arc::clone(&self.resolver);
        let target = ip.to_owned();
        match tokio::task::spawn_blocking(move || resolver.resolve(&target)).await {
            Ok(Ok(hostname)) if !hostname.is_empty() => {
                debug!(ip, hostname = %hostname, "resolved hostname");
                hostname
            }
            Ok(Ok(_)) => ip.to_owned(),
            Ok(Err(e)) => {
                debug!(ip, error = %e, "reverse lookup failed, using IP");
                ip.to_owned()
            }
            Err(e) => {
                warn!(ip, error = %e, "reverse lookup task failed, using IP");
                ip.to_owned()
            }
        }
    }

    /// Drop expired entries. Returns how many were evicted.
    pub async fn clear_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "cleared expired hostnames");
        }
        evicted
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().await;
        let expired = entries
            .values()
            .filter(|entry| entry.stored_at.elapsed() >= self.ttl)
            .count();
        CacheStats {
            total: entries.len(),
            active: entries.len() - expired,
            expired,
            ttl: self.ttl,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for HostnameCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostnameCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
