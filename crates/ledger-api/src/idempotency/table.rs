use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use super::{CachedResponse, ClaimOutcome, ClaimToken, StoreEntry};

#[derive(Debug, Clone)]
enum Slot {
    InFlight {
        token: ClaimToken,
        claimed_at: DateTime<Utc>,
    },
    Completed(Completed),
}

#[derive(Debug, Clone)]
struct Completed {
    response: CachedResponse,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// `key -> fingerprint -> slot` index shared by every store backend.
///
/// The outer map answers "is this key live under another fingerprint" without
/// scanning; the inner map answers exact-pair lookups. Callers supply `now`
/// so expiry is decided once per operation.
#[derive(Debug, Clone)]
pub(super) struct EntryTable {
    slots: HashMap<String, HashMap<String, Slot>>,
    ttl: TimeDelta,
    claim_timeout: TimeDelta,
    dirty: bool,
}

impl EntryTable {
    pub(super) fn new(ttl: Duration, claim_timeout: Duration) -> Self {
        Self {
            slots: HashMap::new(),
            ttl: to_time_delta(ttl),
            claim_timeout: to_time_delta(claim_timeout),
            dirty: false,
        }
    }

    pub(super) fn lookup(
        &mut self,
        key: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Option<CachedResponse> {
        if is_blank(key, fingerprint) {
            return None;
        }

        let completed = match self.slots.get(key)?.get(fingerprint)? {
            Slot::Completed(completed) => completed,
            Slot::InFlight { .. } => return None,
        };

        if completed.expires_at < now {
            self.remove(key, fingerprint);
            self.dirty = true;
            return None;
        }

        Some(completed.response.clone())
    }

    pub(super) fn has_conflict(&self, key: &str, fingerprint: &str, now: DateTime<Utc>) -> bool {
        if is_blank(key, fingerprint) {
            return false;
        }

        self.slots.get(key).is_some_and(|by_fingerprint| {
            by_fingerprint
                .iter()
                .any(|(other, slot)| other != fingerprint && self.is_live(slot, now))
        })
    }

    pub(super) fn store(
        &mut self,
        key: &str,
        fingerprint: &str,
        response: CachedResponse,
        now: DateTime<Utc>,
    ) {
        if is_blank(key, fingerprint) {
            return;
        }

        self.slots.entry(key.to_string()).or_default().insert(
            fingerprint.to_string(),
            Slot::Completed(Completed {
                response,
                created_at: now,
                expires_at: now
                    .checked_add_signed(self.ttl)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            }),
        );
        self.dirty = true;
    }

    pub(super) fn try_claim(
        &mut self,
        key: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> ClaimOutcome {
        if is_blank(key, fingerprint) {
            return ClaimOutcome::Acquired(ClaimToken::new());
        }

        if self.has_conflict(key, fingerprint, now) {
            return ClaimOutcome::Conflict;
        }

        let current = self
            .slots
            .get(key)
            .and_then(|by_fingerprint| by_fingerprint.get(fingerprint));

        match current {
            Some(Slot::Completed(completed)) if completed.expires_at >= now => {
                return ClaimOutcome::Completed(completed.response.clone());
            }
            Some(Slot::Completed(_)) => {
                // Expired entries give way to the new claim.
                self.dirty = true;
            }
            Some(slot @ Slot::InFlight { .. }) if self.is_live(slot, now) => {
                return ClaimOutcome::InFlight;
            }
            Some(Slot::InFlight { .. }) | None => {}
        }

        let token = ClaimToken::new();
        self.slots.entry(key.to_string()).or_default().insert(
            fingerprint.to_string(),
            Slot::InFlight {
                token,
                claimed_at: now,
            },
        );
        ClaimOutcome::Acquired(token)
    }

    pub(super) fn complete(
        &mut self,
        key: &str,
        fingerprint: &str,
        token: ClaimToken,
        response: CachedResponse,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.holds_claim(key, fingerprint, token) {
            return false;
        }

        self.store(key, fingerprint, response, now);
        true
    }

    pub(super) fn release(&mut self, key: &str, fingerprint: &str, token: ClaimToken) {
        if self.holds_claim(key, fingerprint, token) {
            self.remove(key, fingerprint);
        }
    }

    fn holds_claim(&self, key: &str, fingerprint: &str, token: ClaimToken) -> bool {
        self.slots
            .get(key)
            .and_then(|by_fingerprint| by_fingerprint.get(fingerprint))
            .is_some_and(|slot| matches!(slot, Slot::InFlight { token: held, .. } if *held == token))
    }

    pub(super) fn contains(&self, key: &str, fingerprint: &str) -> bool {
        self.slots
            .get(key)
            .and_then(|by_fingerprint| by_fingerprint.get(fingerprint))
            .is_some_and(|slot| matches!(slot, Slot::Completed(_)))
    }

    pub(super) fn delete_expired(&mut self, now: DateTime<Utc>) -> usize {
        let claim_timeout = self.claim_timeout;
        let mut removed = 0;
        let mut removed_completed = false;

        self.slots.retain(|_, by_fingerprint| {
            by_fingerprint.retain(|_, slot| {
                let keep = slot_is_live(slot, now, claim_timeout);
                if !keep {
                    removed += 1;
                    removed_completed |= matches!(slot, Slot::Completed(_));
                }
                keep
            });
            !by_fingerprint.is_empty()
        });

        self.dirty |= removed_completed;
        removed
    }

    /// Completed entries only; in-flight claims are process-local.
    pub(super) fn entries(&self) -> Vec<StoreEntry> {
        let mut entries: Vec<_> = self
            .slots
            .iter()
            .flat_map(|(key, by_fingerprint)| {
                by_fingerprint
                    .iter()
                    .filter_map(move |(fingerprint, slot)| match slot {
                        Slot::Completed(completed) => Some(StoreEntry {
                            key: key.clone(),
                            fingerprint: fingerprint.clone(),
                            response: completed.response.clone(),
                            created_at: completed.created_at,
                            expires_at: completed.expires_at,
                        }),
                        Slot::InFlight { .. } => None,
                    })
            })
            .collect();
        entries.sort_by(|left, right| {
            left.key
                .cmp(&right.key)
                .then_with(|| left.fingerprint.cmp(&right.fingerprint))
        });
        entries
    }

    pub(super) fn insert_entry(&mut self, entry: StoreEntry) {
        if is_blank(&entry.key, &entry.fingerprint) {
            return;
        }

        self.slots.entry(entry.key).or_default().insert(
            entry.fingerprint,
            Slot::Completed(Completed {
                response: entry.response,
                created_at: entry.created_at,
                expires_at: entry.expires_at,
            }),
        );
        self.dirty = true;
    }

    /// Reports whether completed entries changed since the last call.
    pub(super) fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub(super) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn is_live(&self, slot: &Slot, now: DateTime<Utc>) -> bool {
        slot_is_live(slot, now, self.claim_timeout)
    }

    fn remove(&mut self, key: &str, fingerprint: &str) {
        if let Some(by_fingerprint) = self.slots.get_mut(key) {
            by_fingerprint.remove(fingerprint);
            if by_fingerprint.is_empty() {
                self.slots.remove(key);
            }
        }
    }
}

fn slot_is_live(slot: &Slot, now: DateTime<Utc>, claim_timeout: TimeDelta) -> bool {
    match slot {
        Slot::InFlight { claimed_at, .. } => now - *claimed_at <= claim_timeout,
        Slot::Completed(completed) => completed.expires_at >= now,
    }
}

fn is_blank(key: &str, fingerprint: &str) -> bool {
    key.trim().is_empty() || fingerprint.trim().is_empty()
}

fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
