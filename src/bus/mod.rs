//! 1-Wire bus scanning (§4.1). The bus is a single exclusive resource
//! shared with `ThermoController`'s temperature reads; `OneWireBus` is the
//! capability seam both sides are written against, following the
//! port-trait pattern for hardware adapters (read side only — there is no
//! actuation through this bus).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// A 64-bit hardware token identifier read from the 1-Wire bus. Equality is
/// bitwise; tokens are ephemeral references to physical buttons, never
/// owned by this system.
pub type TokenId = u64;

/// Read-side port for the 1-Wire bus. The real adapter enumerates devices
/// over a serial line; `MockBus` drives the test suite.
pub trait OneWireBus: Send + Sync {
    /// Enumerate every device currently on the bus. May fail with a bus
    /// I/O error (§7 `BusIoError`); a failed scan leaves the previous
    /// published snapshot untouched.
    fn scan(&mut self) -> Result<HashSet<TokenId>, String>;
}

/// Byte-oriented adapter over the 1-Wire device path. Framing mirrors
/// `flow::SerialFlowController`: the wire protocol is out of scope for
/// this core (§1), so this writes a single scan command and reads back a
/// count-prefixed list of 8-byte token ids — enough to exercise the
/// device file without inventing a protocol this spec doesn't define.
pub struct SerialOneWireBus {
    device: std::fs::File,
}

impl SerialOneWireBus {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, String> {
        let device = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| format!("open {}: {e}", path.as_ref().display()))?;
        Ok(Self { device })
    }
}

impl OneWireBus for SerialOneWireBus {
    fn scan(&mut self) -> Result<HashSet<TokenId>, String> {
        use std::io::{Read, Write};
        self.device
            .write_all(&[b'S'])
            .map_err(|e| format!("write scan command: {e}"))?;

        let mut count_buf = [0u8; 1];
        self.device
            .read_exact(&mut count_buf)
            .map_err(|e| format!("read token count: {e}"))?;

        let mut tokens = HashSet::with_capacity(count_buf[0] as usize);
        for _ in 0..count_buf[0] {
            let mut buf = [0u8; 8];
            self.device
                .read_exact(&mut buf)
                .map_err(|e| format!("read token: {e}"))?;
            tokens.insert(TokenId::from_le_bytes(buf));
        }
        Ok(tokens)
    }
}

/// mapping token_id → last_seen_monotonic (§3). Tokens absent from a scan
/// keep their prior `last_seen` — consumers judge staleness, not presence
/// in the map.
#[derive(Debug, Clone, Default)]
pub struct PresenceSnapshot {
    pub present: HashSet<TokenId>,
    pub last_seen: HashMap<TokenId, Instant>,
}

impl PresenceSnapshot {
    pub fn last_seen_age(&self, token: TokenId, now: Instant) -> Option<Duration> {
        self.last_seen.get(&token).map(|t| now.saturating_duration_since(*t))
    }
}

/// Single-writer (scanner), multi-reader (supervisor, pour session)
/// publication slot. Readers always observe a consistent snapshot because
/// the whole map is swapped atomically under one lock, never mutated
/// field-by-field while held by a reader.
#[derive(Debug, Clone)]
pub struct PresenceMap {
    inner: Arc<RwLock<PresenceSnapshot>>,
}

impl Default for PresenceMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceMap {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(PresenceSnapshot::default())),
        }
    }

    pub async fn snapshot(&self) -> PresenceSnapshot {
        self.inner.read().await.clone()
    }

    async fn publish(&self, present: HashSet<TokenId>, now: Instant) {
        let mut guard = self.inner.write().await;
        for &token in &present {
            guard.last_seen.insert(token, now);
        }
        guard.present = present;
    }

    /// Refresh a single token's `last_seen` to "now", as if one bus scan
    /// had just observed it. Used by tests that need to simulate presence
    /// without spinning up a `BusScanner`.
    #[cfg(any(test, feature = "test-support"))]
    pub async fn publish_for_test(&self, token: TokenId) {
        let mut present = self.inner.read().await.present.clone();
        present.insert(token);
        self.publish(present, Instant::now()).await;
    }
}

/// Periodically enumerates the bus, filters the configured ignore-list,
/// and publishes a fresh `PresenceMap`. Runs on its own task; holds the
/// bus mutex only for the duration of one refresh (§4.1, §5).
pub struct BusScanner<B: OneWireBus> {
    bus: Arc<tokio::sync::Mutex<B>>,
    presence: PresenceMap,
    ignore: HashSet<TokenId>,
    refresh_interval: Duration,
}

impl<B: OneWireBus + 'static> BusScanner<B> {
    pub fn new(
        bus: Arc<tokio::sync::Mutex<B>>,
        presence: PresenceMap,
        ignore: HashSet<TokenId>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            bus,
            presence,
            ignore,
            refresh_interval,
        }
    }

    pub fn presence(&self) -> PresenceMap {
        self.presence.clone()
    }

    /// Run the refresh loop until `shutdown` is cancelled.
    #[instrument(skip_all, name = "bus_scanner")]
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.refresh_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("bus scanner stopping");
                    return;
                }
                _ = interval.tick() => {
                    self.refresh_once().await;
                }
            }
        }
    }

    async fn refresh_once(&self) {
        let scanned = {
            let mut bus = self.bus.lock().await;
            bus.scan()
        };
        match scanned {
            Ok(mut found) => {
                found.retain(|t| !self.ignore.contains(t));
                self.presence.publish(found, Instant::now()).await;
            }
            Err(e) => {
                let err = crate::error::CoreError::BusIo(e);
                warn!("{err}; keeping previous presence snapshot");
            }
        }
    }
}

/// In-memory bus for tests: returns whatever `HashSet` was last installed
/// via `set_present`, optionally failing the next `scan`.
#[derive(Debug, Default)]
pub struct MockBus {
    present: HashSet<TokenId>,
    fail_next: bool,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_present(&mut self, tokens: impl IntoIterator<Item = TokenId>) {
        self.present = tokens.into_iter().collect();
    }

    pub fn fail_next_scan(&mut self) {
        self.fail_next = true;
    }
}

impl OneWireBus for MockBus {
    fn scan(&mut self) -> Result<HashSet<TokenId>, String> {
        if self.fail_next {
            self.fail_next = false;
            return Err("simulated bus I/O error".to_string());
        }
        Ok(self.present.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishes_present_set_and_last_seen() {
        let presence = PresenceMap::new();
        let mut bus = MockBus::new();
        bus.set_present([0xA1, 0xB2]);
        let bus = Arc::new(tokio::sync::Mutex::new(bus));
        let scanner = BusScanner::new(bus, presence.clone(), HashSet::new(), Duration::from_millis(10));

        scanner.refresh_once().await;

        let snap = presence.snapshot().await;
        assert!(snap.present.contains(&0xA1));
        assert!(snap.present.contains(&0xB2));
        assert!(snap.last_seen.contains_key(&0xA1));
    }

    #[tokio::test]
    async fn ignore_list_is_filtered_out() {
        let presence = PresenceMap::new();
        let mut bus = MockBus::new();
        bus.set_present([0xA1, 0xFF]);
        let bus = Arc::new(tokio::sync::Mutex::new(bus));
        let ignore: HashSet<TokenId> = [0xFFu64].into_iter().collect();
        let scanner = BusScanner::new(bus, presence.clone(), ignore, Duration::from_millis(10));

        scanner.refresh_once().await;

        let snap = presence.snapshot().await;
        assert!(snap.present.contains(&0xA1));
        assert!(!snap.present.contains(&0xFF));
    }

    #[tokio::test]
    async fn bus_error_keeps_previous_snapshot() {
        let presence = PresenceMap::new();
        let mut bus = MockBus::new();
        bus.set_present([0xA1]);
        let bus_handle = Arc::new(tokio::sync::Mutex::new(bus));
        let scanner = BusScanner::new(bus_handle.clone(), presence.clone(), HashSet::new(), Duration::from_millis(10));
        scanner.refresh_once().await;
        assert!(presence.snapshot().await.present.contains(&0xA1));

        bus_handle.lock().await.fail_next_scan();
        scanner.refresh_once().await;

        // Previous snapshot (0xA1 present) is untouched by the failed scan.
        let snap = presence.snapshot().await;
        assert!(snap.present.contains(&0xA1));
    }

    #[tokio::test]
    async fn stale_token_is_not_removed_from_last_seen() {
        let presence = PresenceMap::new();
        let mut bus = MockBus::new();
        bus.set_present([0xA1]);
        let bus = Arc::new(tokio::sync::Mutex::new(bus));
        let scanner = BusScanner::new(bus.clone(), presence.clone(), HashSet::new(), Duration::from_millis(10));
        scanner.refresh_once().await;

        bus.lock().await.set_present([]);
        scanner.refresh_once().await;

        let snap = presence.snapshot().await;
        assert!(!snap.present.contains(&0xA1));
        assert!(snap.last_seen.contains_key(&0xA1), "last_seen entries persist for staleness checks");
    }
}
