//! Time-windowed suppression of duplicate submissions.
//!
//! Keys are `(destination, fingerprint)`. The first observation records the
//! key with an expiry of `now + window` and is accepted; any repeat before
//! expiry is reported as a duplicate without touching the stored expiry, so
//! the window never slides. A window past the clock's range records an entry
//! that never expires. Expired entries are treated as absent and are removed
//! by [`DeduplicationCache::purge_expired`].

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use courier_core::{Clock, DestinationId, WebhookPayload};
use dashmap::{mapref::entry::Entry, DashMap};
use sha2::{Digest, Sha256};

use crate::signature::canonical_json;

/// Derives the fingerprint identifying logically equivalent payloads.
pub type FingerprintFn = Arc<dyn Fn(&WebhookPayload) -> String + Send + Sync>;

/// Default fingerprint: SHA-256 hex of the event name and the canonical JSON
/// of the event data.
///
/// The payload id is deliberately excluded so that a producer retrying the
/// same logical event with a fresh id is still suppressed.
pub fn default_fingerprint(payload: &WebhookPayload) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.event.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_json(&payload.data).as_bytes());
    hex::encode(hasher.finalize())
}

/// Cache-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupConfig {
    /// Whether submissions are checked at all.
    pub enabled: bool,
    /// Suppression window.
    pub window: Duration,
    /// How often the engine purges expired entries.
    pub sweep_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Per-submission overrides.
#[derive(Clone, Default)]
pub struct DedupOptions {
    /// Overrides [`DedupConfig::enabled`].
    pub enabled: Option<bool>,
    /// Overrides [`DedupConfig::window`].
    pub window: Option<Duration>,
    /// Replaces the cache's fingerprint function.
    pub fingerprint: Option<FingerprintFn>,
}

impl DedupOptions {
    /// Disables deduplication for the submission.
    pub fn disabled() -> Self {
        Self { enabled: Some(false), ..Self::default() }
    }

    /// Uses a custom window.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// Uses a custom fingerprint function.
    #[must_use]
    pub fn with_fingerprint(
        mut self,
        fingerprint: impl Fn(&WebhookPayload) -> String + Send + Sync + 'static,
    ) -> Self {
        self.fingerprint = Some(Arc::new(fingerprint));
        self
    }
}

impl fmt::Debug for DedupOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupOptions")
            .field("enabled", &self.enabled)
            .field("window", &self.window)
            .field("fingerprint", &self.fingerprint.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// Key recorded by a dedup check: the destination and the payload
/// fingerprint.
pub type DedupKey = (DestinationId, String);

/// Outcome of a dedup check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    /// Checking is disabled for the submission; nothing was recorded.
    Skipped,
    /// First observation within the window; the key was recorded.
    Recorded(DedupEntry),
    /// The same key was recorded within its window.
    Duplicate,
}

impl DedupDecision {
    /// Whether the submission should be suppressed.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Handle to an entry recorded by [`DeduplicationCache::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    key: DedupKey,
    generation: u64,
}

impl DedupEntry {
    /// Key the entry was recorded under.
    pub fn key(&self) -> &DedupKey {
        &self.key
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    /// `None` when `now + window` is beyond what the clock can represent.
    expires_at: Option<Instant>,
    generation: u64,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > now)
    }
}

/// Concurrent deduplication cache with atomic per-key check-and-set.
#[derive(Clone)]
pub struct DeduplicationCache {
    config: DedupConfig,
    clock: Arc<dyn Clock>,
    fingerprint: FingerprintFn,
    entries: Arc<DashMap<DedupKey, Slot>>,
    generation: Arc<AtomicU64>,
}

impl DeduplicationCache {
    /// Creates a cache using [`default_fingerprint`].
    pub fn new(config: DedupConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            fingerprint: Arc::new(default_fingerprint),
            entries: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replaces the cache-wide fingerprint function.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: FingerprintFn) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    /// Checks and records `payload` for `destination` with cache defaults.
    pub fn is_duplicate(&self, destination: &DestinationId, payload: &WebhookPayload) -> bool {
        self.check(destination, payload, &DedupOptions::default())
    }

    /// Checks and records `payload` for `destination` honoring overrides.
    ///
    /// Returns `true` only when the same key was recorded within its window.
    /// Disabled checks neither record nor report duplicates.
    pub fn check(
        &self,
        destination: &DestinationId,
        payload: &WebhookPayload,
        options: &DedupOptions,
    ) -> bool {
        self.decide(destination, payload, options).is_duplicate()
    }

    /// Like [`Self::check`], but returns a handle to the recorded entry so
    /// the caller can [`Self::forget`] it.
    ///
    /// A window too large for the clock to represent records an entry that
    /// never expires.
    pub fn decide(
        &self,
        destination: &DestinationId,
        payload: &WebhookPayload,
        options: &DedupOptions,
    ) -> DedupDecision {
        if !options.enabled.unwrap_or(self.config.enabled) {
            return DedupDecision::Skipped;
        }

        let window = options.window.unwrap_or(self.config.window);
        let fingerprint = match &options.fingerprint {
            Some(custom) => custom(payload),
            None => (self.fingerprint)(payload),
        };
        let now = self.clock.now();
        let slot = Slot {
            expires_at: now.checked_add(window),
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
        };

        match self.entries.entry((destination.clone(), fingerprint)) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    tracing::debug!(
                        destination_id = %destination,
                        fingerprint = %entry.key().1,
                        "duplicate submission suppressed"
                    );
                    DedupDecision::Duplicate
                } else {
                    entry.insert(slot);
                    DedupDecision::Recorded(DedupEntry {
                        key: entry.key().clone(),
                        generation: slot.generation,
                    })
                }
            },
            Entry::Vacant(entry) => {
                let key = entry.key().clone();
                entry.insert(slot);
                DedupDecision::Recorded(DedupEntry { key, generation: slot.generation })
            },
        }
    }

    /// Drops a recorded entry so the next identical submission is accepted.
    /// Used when a submission was checked but never enqueued.
    ///
    /// Does nothing if the key has since been recorded again. Returns
    /// whether the entry was removed.
    pub fn forget(&self, entry: &DedupEntry) -> bool {
        self.entries
            .remove_if(&entry.key, |_, slot| slot.generation == entry.generation)
            .is_some()
    }

    /// Removes expired entries and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache-wide defaults.
    pub fn config(&self) -> &DedupConfig {
        &self.config
    }
}

impl fmt::Debug for DeduplicationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeduplicationCache")
            .field("config", &self.config)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}
