//! Bounded registry of opaque tokens handed out to the command surface.
//!
//! Search results and chapter listings are registered here and referenced by
//! token in follow-up commands. Entries live in an arena indexed by slot;
//! each slot carries a generation that is bumped on reuse, so a stale token
//! can never resolve to a newer value. The registry holds at most `capacity`
//! live entries (oldest evicted first) and drops entries older than `ttl`.

use std::{
    collections::VecDeque,
    fmt,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{error::CoreError, time::Clock};

/// Generation-stamped handle to a registry entry.
///
/// The string form is `<slot>-<generation>` in lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Token {
    slot: u32,
    generation: u32,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{:x}", self.slot, self.generation)
    }
}

impl FromStr for Token {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidInput(format!("malformed token: {s}"));
        let (slot, generation) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            slot: u32::from_str_radix(slot, 16).map_err(|_| invalid())?,
            generation: u32::from_str_radix(generation, 16).map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for Token {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Token> for String {
    fn from(token: Token) -> Self {
        token.to_string()
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<(T, Instant)>,
}

struct RegistryState<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    order: VecDeque<Token>,
    live: usize,
}

impl<T> RegistryState<T> {
    fn is_live(&self, token: Token) -> bool {
        self.slots
            .get(token.slot as usize)
            .is_some_and(|slot| slot.generation == token.generation && slot.value.is_some())
    }

    fn take(&mut self, token: Token) -> Option<(T, Instant)> {
        let slot = self.slots.get_mut(token.slot as usize)?;
        if slot.generation != token.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(token.slot);
        self.live -= 1;
        Some(value)
    }

    fn evict_oldest(&mut self) {
        while let Some(token) = self.order.pop_front() {
            if self.take(token).is_some() {
                return;
            }
        }
    }

    fn compact_order(&mut self) {
        if self.order.len() > self.live.saturating_mul(2).max(64) {
            let order = std::mem::take(&mut self.order);
            self.order = order.into_iter().filter(|token| self.is_live(*token)).collect();
        }
    }
}

/// Arena of values addressed by [`Token`].
pub struct TokenRegistry<T> {
    state: Mutex<RegistryState<T>>,
    capacity: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<T: Clone> TokenRegistry<T> {
    /// Creates a registry. A zero `capacity` is treated as one.
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                slots: Vec::new(),
                free: Vec::new(),
                order: VecDeque::new(),
                live: 0,
            }),
            capacity: capacity.max(1),
            ttl,
            clock,
        }
    }

    /// Stores `value` and returns its token, evicting the oldest entry when
    /// the registry is full.
    pub fn insert(&self, value: T) -> Token {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if state.live >= self.capacity {
            state.evict_oldest();
        }

        let slot = match state.free.pop() {
            Some(slot) => slot,
            None => {
                state.slots.push(Slot { generation: 0, value: None });
                u32::try_from(state.slots.len() - 1).unwrap_or(u32::MAX)
            },
        };

        let entry = &mut state.slots[slot as usize];
        entry.value = Some((value, now));
        let token = Token { slot, generation: entry.generation };

        state.live += 1;
        state.order.push_back(token);
        state.compact_order();
        token
    }

    /// Resolves a token. Expired entries are removed and yield `None`.
    pub fn get(&self, token: Token) -> Option<T> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let slot = state.slots.get(token.slot as usize)?;
        if slot.generation != token.generation {
            return None;
        }
        let (value, inserted_at) = slot.value.as_ref()?;
        if now.saturating_duration_since(*inserted_at) > self.ttl {
            state.take(token);
            return None;
        }
        Some(value.clone())
    }

    /// Removes a token, returning its value if it was live.
    pub fn remove(&self, token: Token) -> Option<T> {
        self.state.lock().take(token).map(|(value, _)| value)
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let expired: Vec<Token> = state
            .order
            .iter()
            .copied()
            .filter(|token| {
                state.slots.get(token.slot as usize).is_some_and(|slot| {
                    slot.generation == token.generation
                        && slot.value.as_ref().is_some_and(|(_, inserted_at)| {
                            now.saturating_duration_since(*inserted_at) > self.ttl
                        })
                })
            })
            .collect();

        let removed = expired.into_iter().filter(|token| state.take(*token).is_some()).count();
        state.compact_order();
        removed
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.state.lock().live
    }

    /// True when no entry is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> fmt::Debug for TokenRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRegistry")
            .field("live", &self.state.lock().live)
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TestClock;

    fn registry(capacity: usize) -> (TokenRegistry<String>, TestClock) {
        let clock = TestClock::new();
        let registry =
            TokenRegistry::new(capacity, Duration::from_secs(60), Arc::new(clock.clone()));
        (registry, clock)
    }

    #[test]
    fn insert_then_get() {
        let (registry, _) = registry(4);
        let token = registry.insert("one-piece".to_string());
        assert_eq!(registry.get(token).as_deref(), Some("one-piece"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn oldest_entry_is_evicted_at_capacity() {
        let (registry, _) = registry(2);
        let first = registry.insert("a".to_string());
        let second = registry.insert("b".to_string());
        let third = registry.insert("c".to_string());

        assert_eq!(registry.get(first), None);
        assert_eq!(registry.get(second).as_deref(), Some("b"));
        assert_eq!(registry.get(third).as_deref(), Some("c"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn stale_token_does_not_resolve_reused_slot() {
        let (registry, _) = registry(1);
        let old = registry.insert("old".to_string());
        let new = registry.insert("new".to_string());

        assert_eq!(old.slot, new.slot);
        assert_ne!(old, new);
        assert_eq!(registry.get(old), None);
        assert_eq!(registry.get(new).as_deref(), Some("new"));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (registry, clock) = registry(8);
        let token = registry.insert("x".to_string());

        clock.advance(Duration::from_secs(61));

        assert_eq!(registry.get(token), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn purge_removes_only_expired() {
        let (registry, clock) = registry(8);
        registry.insert("old".to_string());
        clock.advance(Duration::from_secs(45));
        let fresh = registry.insert("fresh".to_string());
        clock.advance(Duration::from_secs(30));

        assert_eq!(registry.purge_expired(), 1);
        assert_eq!(registry.get(fresh).as_deref(), Some("fresh"));
    }

    #[test]
    fn token_string_round_trip() {
        let token = Token { slot: 26, generation: 3 };
        assert_eq!(token.to_string(), "1a-3");
        assert_eq!("1a-3".parse::<Token>().ok(), Some(token));
        assert!("nope".parse::<Token>().is_err());
    }

    #[test]
    fn removed_token_is_gone() {
        let (registry, _) = registry(4);
        let token = registry.insert("gone".to_string());
        assert_eq!(registry.remove(token).as_deref(), Some("gone"));
        assert_eq!(registry.get(token), None);
        assert_eq!(registry.remove(token), None);
    }
}
