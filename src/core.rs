//! The unsynchronized address manager core.
//!
//! Every method here is a plain, non-reentrant mutation or query over an
//! in-memory arena. No I/O, no locking, no wall-clock reads: callers
//! (the concurrency wrapper in [`crate::manager`]) are responsible for
//! supplying `now` and for serializing access.

use std::collections::HashMap;
use std::net::IpAddr;

use rand::RngCore;

use crate::endpoint::Endpoint;
use crate::entry::ExtendedEntry;
use crate::hashing::{self, SecretKey};
use crate::tables::{
    BucketMatrix, LOG_BUCKET_SIZE_BITS, LOG_NEW_BUCKET_COUNT_BITS, LOG_TRIED_BUCKET_COUNT_BITS,
    NEW_BUCKETS_PER_ADDRESS, NEW_BUCKET_COUNT, TRIED_BUCKET_COUNT, TRIED_COLLISION_SIZE,
};

/// The id of a live [`ExtendedEntry`] within a manager's arena. Ids are
/// never reused within the lifetime of a core: once an entry is deleted,
/// its id is gone for good (spec §8, "no resurrection").
pub type EntryId = i64;

/// All mutable state for one address manager instance, minus the lock
/// and the clock.
pub struct AddressManagerCore {
    key: SecretKey,
    id_count: EntryId,
    entries: HashMap<EntryId, ExtendedEntry>,
    /// Keyed by host alone (not host+port), matching the original: a
    /// host can only ever resolve to one id, so a second endpoint on the
    /// same host updates the existing entry rather than coexisting
    /// alongside it.
    map_addr: HashMap<IpAddr, EntryId>,
    random_order: Vec<EntryId>,
    new_table: BucketMatrix,
    tried_table: BucketMatrix,
    new_count: usize,
    tried_count: usize,
    /// Manager-wide timestamp of the last successful connection to any
    /// peer. `attempt`'s failure-counting guard compares against this,
    /// not a per-entry field (spec §9's "likely source bug" note: the
    /// original Python compares `nLastCountAttempt < info.nLastGood`,
    /// but `nLastGood` only ever exists on the manager). Seeded to `1`,
    /// matching the original's `nLastGood = 1` at construction.
    last_good: i64,
    tried_collisions: Vec<EntryId>,
    rng: Box<dyn RngCore + Send>,
}

impl AddressManagerCore {
    /// Build an empty manager with a freshly drawn secret key.
    pub fn new(mut rng: Box<dyn RngCore + Send>) -> Self {
        let key = SecretKey::random(&mut *rng);
        Self::with_key(key, rng)
    }

    /// Build an empty manager with an explicit secret key (used by
    /// tests that need reproducible bucket placement, and by
    /// `unserialize`, which restores a persisted key).
    pub fn with_key(key: SecretKey, rng: Box<dyn RngCore + Send>) -> Self {
        AddressManagerCore {
            key,
            id_count: 0,
            entries: HashMap::new(),
            map_addr: HashMap::new(),
            random_order: Vec::new(),
            new_table: BucketMatrix::new(NEW_BUCKET_COUNT as usize),
            tried_table: BucketMatrix::new(TRIED_BUCKET_COUNT as usize),
            new_count: 0,
            tried_count: 0,
            last_good: 1,
            tried_collisions: Vec::new(),
            rng,
        }
    }

    /// Total number of live entries (NEW + TRIED).
    pub fn size(&self) -> usize {
        self.random_order.len()
    }

    pub fn new_count(&self) -> usize {
        self.new_count
    }

    pub fn tried_count(&self) -> usize {
        self.tried_count
    }

    pub fn secret_key(&self) -> SecretKey {
        self.key
    }

    pub fn tried_collisions(&self) -> &[EntryId] {
        &self.tried_collisions
    }

    pub fn entry(&self, id: EntryId) -> Option<&ExtendedEntry> {
        self.entries.get(&id)
    }

    /// Rebuild a manager from parts already reconstructed by the text
    /// serializer. Not for general use — `new`/`with_key` are the public
    /// constructors.
    pub(crate) fn from_parts(
        key: SecretKey,
        rng: Box<dyn RngCore + Send>,
        entries: HashMap<EntryId, ExtendedEntry>,
        map_addr: HashMap<IpAddr, EntryId>,
        random_order: Vec<EntryId>,
        new_table: BucketMatrix,
        tried_table: BucketMatrix,
        new_count: usize,
        tried_count: usize,
        id_count: EntryId,
    ) -> Self {
        AddressManagerCore {
            key,
            id_count,
            entries,
            map_addr,
            random_order,
            new_table,
            tried_table,
            new_count,
            tried_count,
            last_good: 1,
            tried_collisions: Vec::new(),
            rng,
        }
    }

    /// Delete every entry that failed to claim a NEW slot while loading
    /// (`ref_count == 0` and not in TRIED). Spec §4.8: "Entries that fail
    /// to claim their NEW slot after load are garbage-collected."
    pub(crate) fn gc_orphan_new_entries(&mut self) {
        let orphans: Vec<EntryId> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.is_tried && e.ref_count == 0)
            .map(|(&id, _)| id)
            .collect();
        for id in orphans {
            self.delete_new_entry(id);
        }
    }


    // -- internal arena helpers -------------------------------------------------

    fn find(&self, addr: &Endpoint) -> Option<EntryId> {
        self.map_addr.get(&addr.host).copied()
    }

    /// Public lookup of an entry's id by address, for the serializer.
    pub fn id_of(&self, addr: &Endpoint) -> Option<EntryId> {
        self.find(addr)
    }

    fn create(&mut self, peer: Endpoint, src: Endpoint) -> EntryId {
        let id = self.id_count;
        self.id_count += 1;

        let mut entry = ExtendedEntry::new(peer, src);
        entry.random_pos = self.random_order.len();

        self.map_addr.insert(peer.host, id);
        self.random_order.push(id);
        self.entries.insert(id, entry);
        id
    }

    fn swap_random(&mut self, pos1: usize, pos2: usize) {
        if pos1 == pos2 {
            return;
        }
        let id1 = self.random_order[pos1];
        let id2 = self.random_order[pos2];
        self.entries.get_mut(&id1).unwrap().random_pos = pos2;
        self.entries.get_mut(&id2).unwrap().random_pos = pos1;
        self.random_order.swap(pos1, pos2);
    }

    /// Remove an id from the arena entirely. Only valid for an entry
    /// that is not (and never was) in TRIED and holds no NEW slots.
    fn delete_new_entry(&mut self, id: EntryId) {
        let entry = self.entries.get(&id).expect("delete of unknown entry id");
        let last = self.random_order.len() - 1;
        self.swap_random(entry.random_pos, last);
        self.random_order.pop();
        let host = self.entries.get(&id).unwrap().peer.host;
        self.map_addr.remove(&host);
        self.entries.remove(&id);
        self.new_count -= 1;
    }

    /// Clear a NEW slot, decrementing the occupant's refcount and
    /// deleting it outright if that was its last reference.
    fn clear_new_slot(&mut self, bucket: u16, pos: u8) {
        if let Some(id) = self.new_table.get(bucket as usize, pos as usize) {
            let ref_count = {
                let entry = self.entries.get_mut(&id).expect("dangling NEW slot");
                entry.ref_count -= 1;
                entry.ref_count
            };
            self.new_table.clear(bucket as usize, pos as usize);
            if ref_count == 0 {
                self.delete_new_entry(id);
            }
        }
    }

    fn tried_bucket_of(&self, id: EntryId) -> (u16, u8) {
        let entry = &self.entries[&id];
        let bucket = hashing::tried_bucket(&self.key, &entry.peer);
        let pos = hashing::bucket_pos(&self.key, &entry.peer, false, bucket);
        (bucket, pos)
    }

    fn new_bucket_of(&self, id: EntryId, src: &Endpoint) -> (u16, u8) {
        let entry = &self.entries[&id];
        let bucket = hashing::new_bucket(&self.key, &entry.peer, src);
        let pos = hashing::bucket_pos(&self.key, &entry.peer, true, bucket);
        (bucket, pos)
    }

    /// Promote `id` into TRIED, evicting any current occupant of its
    /// target slot back into NEW.
    fn make_tried(&mut self, id: EntryId) {
        for bucket in 0..NEW_BUCKET_COUNT {
            let pos = {
                let entry = &self.entries[&id];
                hashing::bucket_pos(&self.key, &entry.peer, true, bucket)
            };
            if self.new_table.get(bucket as usize, pos as usize) == Some(id) {
                self.new_table.clear(bucket as usize, pos as usize);
                self.entries.get_mut(&id).unwrap().ref_count -= 1;
            }
        }
        debug_assert_eq!(self.entries[&id].ref_count, 0);
        self.new_count -= 1;

        let (bucket, pos) = self.tried_bucket_of(id);
        if let Some(evict_id) = self.tried_table.get(bucket as usize, pos as usize) {
            let evict_src = self.entries[&evict_id].src;
            self.entries.get_mut(&evict_id).unwrap().is_tried = false;
            self.tried_table.clear(bucket as usize, pos as usize);
            self.tried_count -= 1;

            let (new_bucket, new_pos) = self.new_bucket_of(evict_id, &evict_src);
            self.clear_new_slot(new_bucket, new_pos);
            self.entries.get_mut(&evict_id).unwrap().ref_count = 1;
            self.new_table
                .set(new_bucket as usize, new_pos as usize, evict_id);
            self.new_count += 1;
        }

        self.tried_table.set(bucket as usize, pos as usize, id);
        self.tried_count += 1;
        self.entries.get_mut(&id).unwrap().is_tried = true;
        let peer = self.entries[&id].peer;
        log::trace!("Promoted peer {}:{} to the tried table", peer.host, peer.port);
    }

    /// Add a single learned endpoint to NEW. Returns `true` iff a brand
    /// new entry was created (used by `add_to_new_table`'s "any entry
    /// created" return value).
    ///
    /// `now` is the caller's current time, threaded in explicitly rather
    /// than read from a wall clock here (spec §9's default-argument
    /// note) — it is only used to judge whether `peer`'s own timestamp
    /// looks "currently online" and whether a colliding NEW-slot
    /// occupant has gone terrible.
    pub fn add_to_new(
        &mut self,
        peer: Endpoint,
        source: Option<Endpoint>,
        penalty: i64,
        now: i64,
    ) -> bool {
        let source = source.unwrap_or(peer);
        let mut penalty = penalty;
        let mut is_new = false;

        let id = match self.find(&peer) {
            Some(id) if self.entries[&id].peer.key() == peer.key() => {
                // Exact match: no penalty applies.
                penalty = 0;
                id
            }
            Some(id) => id,
            None => {
                let id = self.create(peer, source);
                let entry = self.entries.get_mut(&id).unwrap();
                entry.time = (entry.time - penalty).max(0);
                self.new_count += 1;
                is_new = true;
                log::trace!("Learned new candidate peer {}:{}", peer.host, peer.port);
                id
            }
        };

        if !is_new {
            let currently_online = peer.is_currently_online(now);
            let update_interval = if currently_online { 60 * 60 } else { 24 * 60 * 60 };

            let entry = self.entries.get_mut(&id).unwrap();
            if peer.timestamp > 0
                && (entry.time > 0 || entry.time < peer.timestamp - update_interval - penalty)
            {
                entry.time = (peer.timestamp - penalty).max(0);
            }

            let entry = &self.entries[&id];
            if peer.timestamp == 0 || (entry.time > 0 && peer.timestamp <= entry.time) {
                return false;
            }
            if entry.is_tried {
                return false;
            }
            if entry.ref_count == NEW_BUCKETS_PER_ADDRESS {
                return false;
            }
            let factor = 1u32 << entry.ref_count;
            if factor > 1 && self.rng.next_u32() % factor != 0 {
                return false;
            }
        }

        let (bucket, pos) = self.new_bucket_of(id, &source);
        if self.new_table.get(bucket as usize, pos as usize) != Some(id) {
            let occupant = self.new_table.get(bucket as usize, pos as usize);
            let should_insert = match occupant {
                None => true,
                Some(existing) => {
                    let existing_entry = &self.entries[&existing];
                    let entry = &self.entries[&id];
                    existing_entry.is_terrible(now) || (existing_entry.ref_count > 1 && entry.ref_count == 0)
                }
            };

            if should_insert {
                self.clear_new_slot(bucket, pos);
                self.entries.get_mut(&id).unwrap().ref_count += 1;
                self.new_table.set(bucket as usize, pos as usize, id);
            } else if self.entries[&id].ref_count == 0 {
                self.delete_new_entry(id);
            }
        }

        is_new
    }

    /// Mark an endpoint as reachable. No-op if the endpoint is unknown.
    pub fn mark_good(&mut self, addr: Endpoint, test_before_evict: bool, now: i64) {
        self.last_good = now;
        let id = match self.find(&addr) {
            Some(id) if self.entries[&id].peer.key() == addr.key() => id,
            _ => return,
        };

        {
            let entry = self.entries.get_mut(&id).unwrap();
            entry.last_success = now;
            entry.last_try = now;
            entry.attempts = 0;
        }

        if self.entries[&id].is_tried {
            return;
        }

        let start = self.rng.next_u32() as u16 % NEW_BUCKET_COUNT;
        let mut found_bucket = None;
        for n in 0..NEW_BUCKET_COUNT {
            let bucket = (n + start) % NEW_BUCKET_COUNT;
            let pos = {
                let entry = &self.entries[&id];
                hashing::bucket_pos(&self.key, &entry.peer, true, bucket)
            };
            if self.new_table.get(bucket as usize, pos as usize) == Some(id) {
                found_bucket = Some(bucket);
                break;
            }
        }
        if found_bucket.is_none() {
            return;
        }

        let (tried_bucket, tried_pos) = self.tried_bucket_of(id);
        let collision = self
            .tried_table
            .get(tried_bucket as usize, tried_pos as usize);
        match collision {
            Some(_) if test_before_evict => {
                if self.tried_collisions.len() < TRIED_COLLISION_SIZE
                    && !self.tried_collisions.contains(&id)
                {
                    log::trace!(
                        "Queued tried-table collision for peer {}:{}",
                        self.entries[&id].peer.host,
                        self.entries[&id].peer.port
                    );
                    self.tried_collisions.push(id);
                }
            }
            _ => self.make_tried(id),
        }
    }

    /// Record a connection attempt. No-op if the endpoint is unknown.
    pub fn attempt(&mut self, addr: Endpoint, count_failures: bool, now: i64) {
        let id = match self.find(&addr) {
            Some(id) if self.entries[&id].peer.key() == addr.key() => id,
            _ => return,
        };

        let entry = self.entries.get_mut(&id).unwrap();
        entry.last_try = now;
        if count_failures && entry.last_count_attempt < self.last_good {
            entry.last_count_attempt = now;
            entry.attempts += 1;
        }
    }

    /// Refresh an entry's internal timestamp toward `now`, at most once
    /// every 20 minutes. No-op if the endpoint is unknown.
    pub fn connect(&mut self, addr: Endpoint, now: i64) {
        let id = match self.find(&addr) {
            Some(id) if self.entries[&id].peer.key() == addr.key() => id,
            _ => return,
        };
        let entry = self.entries.get_mut(&id).unwrap();
        if now - entry.time > 20 * 60 {
            entry.time = now;
        }
    }

    /// Pick a candidate endpoint to connect to, via rejection sampling
    /// weighted by [`ExtendedEntry::selection_chance`].
    pub fn select_peer(&mut self, new_only: bool, now: i64) -> Option<Endpoint> {
        if self.random_order.is_empty() {
            return None;
        }
        if new_only && self.new_count == 0 {
            return None;
        }

        let use_tried = !new_only
            && self.tried_count > 0
            && (self.new_count == 0 || self.rng.next_u32() % 2 == 0);

        if use_tried {
            self.select_from(&TableKind::Tried, now)
        } else {
            self.select_from(&TableKind::New, now)
        }
    }

    fn select_from(&mut self, kind: &TableKind, now: i64) -> Option<Endpoint> {
        let (stride_bits, matrix_rows_const) = match kind {
            TableKind::Tried => (LOG_TRIED_BUCKET_COUNT_BITS, TRIED_BUCKET_COUNT),
            TableKind::New => (LOG_NEW_BUCKET_COUNT_BITS, NEW_BUCKET_COUNT),
        };

        let mut factor = 1.0f64;

        loop {
            let mut bucket = (self.rng.next_u32() as u16) % matrix_rows_const;
            let mut pos = (self.rng.next_u32() as u8) % 64;

            let id = loop {
                let occupant = match kind {
                    TableKind::Tried => self.tried_table.get(bucket as usize, pos as usize),
                    TableKind::New => self.new_table.get(bucket as usize, pos as usize),
                };

                match occupant {
                    Some(id) => break id,
                    None => {
                        let stride = self.rng.next_u32() % (1 << stride_bits);
                        bucket = (bucket + stride as u16) % matrix_rows_const;
                        let pos_stride = self.rng.next_u32() % (1 << LOG_BUCKET_SIZE_BITS);
                        pos = ((pos as u32 + pos_stride) % 64) as u8;
                    }
                }
            };

            let chance = self.entries[&id].selection_chance(now);
            let threshold = (factor * chance * (1u64 << 30) as f64) as u64;
            let draw = (self.rng.next_u32() & 0x3fff_ffff) as u64;
            if draw < threshold {
                return Some(self.entries[&id].peer);
            }
            factor *= 1.2;
        }
    }

    /// Pick a uniform-random queued collision and return the entry it
    /// would evict, for the caller to probe against.
    pub fn select_tried_collision(&mut self) -> Option<ExtendedEntry> {
        if self.tried_collisions.is_empty() {
            return None;
        }
        let idx = self.rng.next_u32() as usize % self.tried_collisions.len();
        let candidate_id = self.tried_collisions[idx];
        if !self.entries.contains_key(&candidate_id) {
            self.tried_collisions.remove(idx);
            return None;
        }

        let (bucket, pos) = self.tried_bucket_of(candidate_id);
        self.tried_table
            .get(bucket as usize, pos as usize)
            .and_then(|occupant_id| self.entries.get(&occupant_id).cloned())
    }

    /// Resolve every queued tried-table collision: drop stale
    /// candidates, promote candidates whose incumbent looks unhealthy,
    /// keep the incumbent otherwise.
    pub fn resolve_tried_collisions(&mut self, now: i64) {
        for candidate_id in self.tried_collisions.clone() {
            let mut resolved = false;

            if !self.entries.contains_key(&candidate_id) {
                resolved = true;
            } else {
                let candidate_peer = self.entries[&candidate_id].peer;
                let (bucket, pos) = self.tried_bucket_of(candidate_id);
                match self.tried_table.get(bucket as usize, pos as usize) {
                    None => {
                        self.mark_good(candidate_peer, false, now);
                        resolved = true;
                    }
                    Some(incumbent_id) => {
                        let incumbent = &self.entries[&incumbent_id];
                        if now - incumbent.last_success < 4 * 60 * 60 {
                            resolved = true;
                        } else if now - incumbent.last_try < 4 * 60 * 60 {
                            if now - incumbent.last_try > 60 {
                                self.mark_good(candidate_peer, false, now);
                                resolved = true;
                            }
                        } else if now - self.entries[&candidate_id].last_success > 40 * 60 {
                            self.mark_good(candidate_peer, false, now);
                            resolved = true;
                        }
                    }
                }
            }

            if resolved {
                self.tried_collisions.retain(|&id| id != candidate_id);
            }
        }
    }

    /// Reservoir-sample up to `min(2500, 23% of entries)` non-terrible
    /// endpoints, via a partial Fisher-Yates shuffle of `random_order`.
    pub fn get_peers(&mut self, now: i64) -> Vec<Endpoint> {
        let total = self.random_order.len();
        let num_nodes = std::cmp::min(2500, 23 * total / 100);
        let mut out = Vec::with_capacity(num_nodes);

        for n in 0..total {
            if out.len() >= num_nodes {
                break;
            }
            let span = total - n;
            let offset = if span > 0 {
                self.rng.next_u32() as usize % span
            } else {
                0
            };
            self.swap_random(n, n + offset);

            let id = self.random_order[n];
            let entry = &self.entries[&id];
            if !entry.is_terrible(now) {
                let mut peer = entry.peer;
                peer.timestamp = peer.timestamp.max(entry.time);
                out.push(peer);
            }
        }

        out
    }

    // -- iteration helpers for the serializer ------------------------------------

    /// NEW entries (ref_count > 0, not in TRIED), in `random_order`.
    pub fn iter_new_entries(&self) -> impl Iterator<Item = &ExtendedEntry> {
        self.random_order
            .iter()
            .filter_map(move |id| self.entries.get(id))
            .filter(|e| e.ref_count > 0)
    }

    /// TRIED entries, in `random_order`.
    pub fn iter_tried_entries(&self) -> impl Iterator<Item = &ExtendedEntry> {
        self.random_order
            .iter()
            .filter_map(move |id| self.entries.get(id))
            .filter(|e| e.is_tried)
    }

    /// All ids currently occupying NEW bucket `bucket`.
    pub fn new_bucket_members(&self, bucket: u16) -> Vec<EntryId> {
        (0..self.new_table.cols())
            .filter_map(|pos| self.new_table.get(bucket as usize, pos))
            .collect()
    }
}

enum TableKind {
    New,
    Tried,
}
