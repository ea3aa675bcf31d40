//! The pin-once/use-many registered-memory directory (spec §4.4).
//!
//! Registration is delegated to a [`Registrar`] — the verbs backend's
//! protection domain in production, a fake in tests — so the coalescing,
//! refcounting, and LRU-eviction policy here stays hardware-independent.

use hashbrown::HashMap;
use std::collections::VecDeque;

use crate::error::{BmiError, Result};

/// What a successful registration hands back: the local/remote keys the
/// protocol engine glues onto a buflist segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionKeys {
    pub lkey: u32,
    pub rkey: u32,
}

/// Abstraction over "register this address range with the fabric".
/// Implemented by the verbs backend's protection domain wrapper.
pub trait Registrar {
    fn register(&mut self, addr: usize, len: usize) -> Result<RegionKeys>;
    fn deregister(&mut self, addr: usize, len: usize);
}

/// Mutually-exclusive registration strategies, chosen once at init (spec
/// §4.4, §9 "Bounce-buffer vs. early-reg").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationMode {
    /// Register lazily, on the first reference.
    None,
    /// Register as soon as an RTS is queued, to overlap registration
    /// latency with the RTS round-trip.
    EarlyReg,
    /// Use a fixed pre-registered staging area and `memcpy` into/out of
    /// it instead of registering user memory at all.
    BounceBuf,
}

struct Entry {
    addr: usize,
    len: usize,
    keys: RegionKeys,
    pin_refcount: usize,
}

/// Registered-memory directory: one process-wide cache per connection's
/// protection domain (in this crate, one per [`crate::connection::Connection`]).
pub struct MemCache {
    entries: Vec<Option<Entry>>,
    by_addr: HashMap<usize, usize>,
    /// Free (refcount == 0) entries in least-recently-unpinned-first order;
    /// consulted for eviction on an `ENOMEM`-shaped registration failure.
    lru_free: VecDeque<usize>,
}

impl Default for MemCache {
    fn default() -> Self {
        MemCache {
            entries: Vec::new(),
            by_addr: HashMap::new(),
            lru_free: VecDeque::new(),
        }
    }
}

impl MemCache {
    pub fn new() -> Self {
        MemCache::default()
    }

    /// Find an existing entry covering `[addr, addr+len)` exactly (the
    /// coalescing granularity the protocol engine needs — it always
    /// registers the buflist segment it is about to send/receive).
    fn find_covering(&self, addr: usize, len: usize) -> Option<usize> {
        let idx = *self.by_addr.get(&addr)?;
        let e = self.entries[idx].as_ref()?;
        (e.len >= len).then_some(idx)
    }

    /// `register(addr, len) -> {lkey, rkey}`. A hit just bumps the pin
    /// refcount; a miss registers through `registrar`, retrying once
    /// after evicting LRU-free entries on failure.
    pub fn register(
        &mut self,
        registrar: &mut dyn Registrar,
        addr: usize,
        len: usize,
    ) -> Result<RegionKeys> {
        if let Some(idx) = self.find_covering(addr, len) {
            let e = self.entries[idx].as_mut().unwrap();
            if e.pin_refcount == 0 {
                self.lru_free.retain(|&i| i != idx);
            }
            e.pin_refcount += 1;
            return Ok(e.keys);
        }

        let keys = match registrar.register(addr, len) {
            Ok(k) => k,
            Err(_) => {
                self.evict_one(registrar)?;
                registrar.register(addr, len).map_err(|_| {
                    BmiError::Resource(format!(
                        "failed to pin {len} bytes at {addr:#x} after eviction retry"
                    ))
                })?
            }
        };

        let idx = self.entries.len();
        self.entries.push(Some(Entry {
            addr,
            len,
            keys,
            pin_refcount: 1,
        }));
        self.by_addr.insert(addr, idx);
        Ok(keys)
    }

    /// `deregister(addr, len)`: decrement refcount, unpinning (but not
    /// releasing the registration) once it reaches zero — the entry stays
    /// around for reuse until evicted.
    pub fn deregister(&mut self, addr: usize, _len: usize) {
        let Some(&idx) = self.by_addr.get(&addr) else {
            return;
        };
        let Some(e) = self.entries[idx].as_mut() else {
            return;
        };
        if e.pin_refcount == 0 {
            return;
        }
        e.pin_refcount -= 1;
        if e.pin_refcount == 0 {
            self.lru_free.push_back(idx);
        }
    }

    /// Evict the single oldest free entry, deregistering it with the
    /// backend. Used once on a registration miss before retrying.
    fn evict_one(&mut self, registrar: &mut dyn Registrar) -> Result<()> {
        let idx = self
            .lru_free
            .pop_front()
            .ok_or_else(|| BmiError::Resource("no free entries to evict".into()))?;
        if let Some(entry) = self.entries[idx].take() {
            registrar.deregister(entry.addr, entry.len);
            self.by_addr.remove(&entry.addr);
        }
        Ok(())
    }

    #[cfg(test)]
    fn pin_count(&self, addr: usize) -> usize {
        self.by_addr
            .get(&addr)
            .and_then(|&i| self.entries[i].as_ref())
            .map(|e| e.pin_refcount)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRegistrar {
        next_key: u32,
        registered: usize,
        capacity: usize,
    }

    impl FakeRegistrar {
        fn new(capacity: usize) -> Self {
            FakeRegistrar {
                next_key: 1,
                registered: 0,
                capacity,
            }
        }
    }

    impl Registrar for FakeRegistrar {
        fn register(&mut self, _addr: usize, _len: usize) -> Result<RegionKeys> {
            if self.registered >= self.capacity {
                return Err(BmiError::Resource("ENOMEM".into()));
            }
            self.registered += 1;
            let k = self.next_key;
            self.next_key += 1;
            Ok(RegionKeys { lkey: k, rkey: k })
        }

        fn deregister(&mut self, _addr: usize, _len: usize) {
            self.registered -= 1;
        }
    }

    #[test]
    fn first_reference_pins_second_just_bumps_refcount() {
        let mut mc = MemCache::new();
        let mut reg = FakeRegistrar::new(10);
        let k1 = mc.register(&mut reg, 0x1000, 4096).unwrap();
        let k2 = mc.register(&mut reg, 0x1000, 4096).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(mc.pin_count(0x1000), 2);
    }

    #[test]
    fn unpin_to_zero_frees_on_eviction_not_immediately() {
        let mut mc = MemCache::new();
        let mut reg = FakeRegistrar::new(10);
        mc.register(&mut reg, 0x2000, 4096).unwrap();
        mc.deregister(0x2000, 4096);
        assert_eq!(mc.pin_count(0x2000), 0);
        // Still resolvable (not yet evicted) because nothing forced eviction.
        let k = mc.register(&mut reg, 0x2000, 4096).unwrap();
        assert_eq!(mc.pin_count(0x2000), 1);
        let _ = k;
    }

    #[test]
    fn eviction_retry_succeeds_once_a_free_entry_is_reclaimed() {
        let mut mc = MemCache::new();
        let mut reg = FakeRegistrar::new(1);
        mc.register(&mut reg, 0x3000, 4096).unwrap();
        mc.deregister(0x3000, 4096);

        // Registrar is full (capacity 1), but 0x3000 is free — evicting it
        // and retrying must succeed.
        let keys = mc.register(&mut reg, 0x4000, 4096).unwrap();
        assert_eq!(keys.lkey, 2);
        assert!(mc.by_addr.get(&0x3000).is_none());
    }

    #[test]
    fn eviction_retry_fails_when_nothing_is_free() {
        let mut mc = MemCache::new();
        let mut reg = FakeRegistrar::new(1);
        mc.register(&mut reg, 0x5000, 4096).unwrap();
        assert!(mc.register(&mut reg, 0x6000, 4096).is_err());
    }
}
