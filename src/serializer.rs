//! Text-line encoding/decoding of an [`AddressManagerCore`]'s state.
//!
//! The format is intentionally simple and human-readable (spec §9): one
//! value or record per line, UTF-8, LF-terminated. `K` is written as a
//! lowercase hex string rather than the literal "decimal integer"
//! spec §4.8 names — see DESIGN.md for why (no bignum type is needed to
//! round-trip a 256-bit key through hex, whereas decimal would require
//! one).
//!
//! TRIED entries are not written with their bucket coordinates; they are
//! re-derived from `K` on load, exactly as spec §4.8 describes.

use std::collections::HashMap;
use std::net::IpAddr;

use rand::RngCore;

use crate::core::AddressManagerCore;
use crate::endpoint::Endpoint;
use crate::entry::ExtendedEntry;
use crate::error::AddrManError;
use crate::hashing::{self, SecretKey};
use crate::tables::{BucketMatrix, NEW_BUCKETS_PER_ADDRESS, NEW_BUCKET_COUNT, TRIED_BUCKET_COUNT};

/// Render `core`'s full state as the textual persistence format.
pub fn dump(core: &AddressManagerCore) -> String {
    let mut out = String::new();
    out.push_str(&hex::encode(core.secret_key().0));
    out.push('\n');
    out.push_str(&core.new_count().to_string());
    out.push('\n');
    out.push_str(&core.tried_count().to_string());
    out.push('\n');
    out.push_str(&NEW_BUCKET_COUNT.to_string());
    out.push('\n');

    let mut index_of: HashMap<i64, usize> = HashMap::new();
    for (i, entry) in core.iter_new_entries().enumerate() {
        out.push_str(&entry_line(entry));
        out.push('\n');
        if let Some(id) = core.id_of(&entry.peer) {
            index_of.insert(id, i);
        }
    }

    for entry in core.iter_tried_entries() {
        out.push_str(&entry_line(entry));
        out.push('\n');
    }

    for bucket in 0..NEW_BUCKET_COUNT {
        let members = core.new_bucket_members(bucket);
        out.push_str(&members.len().to_string());
        out.push('\n');
        for id in members {
            if let Some(&idx) = index_of.get(&id) {
                out.push_str(&idx.to_string());
                out.push('\n');
            }
        }
    }

    out
}

fn entry_line(entry: &ExtendedEntry) -> String {
    format!(
        "{} {} {} {}",
        entry.peer.host, entry.peer.port, entry.src.host, entry.src.port
    )
}

fn parse_entry_line(line: &str) -> Result<(Endpoint, Endpoint), AddrManError> {
    let mut parts = line.split(' ');
    let host: IpAddr = parts
        .next()
        .ok_or_else(|| AddrManError::Corrupt("missing host field".into()))?
        .parse()
        .map_err(|_| AddrManError::Corrupt("invalid host".into()))?;
    let port: u16 = parts
        .next()
        .ok_or_else(|| AddrManError::Corrupt("missing port field".into()))?
        .parse()
        .map_err(|_| AddrManError::Corrupt("invalid port".into()))?;
    let src_host: IpAddr = parts
        .next()
        .ok_or_else(|| AddrManError::Corrupt("missing src host field".into()))?
        .parse()
        .map_err(|_| AddrManError::Corrupt("invalid src host".into()))?;
    let src_port: u16 = parts
        .next()
        .ok_or_else(|| AddrManError::Corrupt("missing src port field".into()))?
        .parse()
        .map_err(|_| AddrManError::Corrupt("invalid src port".into()))?;

    Ok((Endpoint::new(host, port, 0), Endpoint::new(src_host, src_port, 0)))
}

fn next_line<'a>(lines: &mut impl Iterator<Item = &'a str>, what: &str) -> Result<&'a str, AddrManError> {
    lines
        .next()
        .ok_or_else(|| AddrManError::Corrupt(format!("truncated file: expected {what}")))
}

fn parse_usize(s: &str, what: &str) -> Result<usize, AddrManError> {
    s.trim()
        .parse()
        .map_err(|_| AddrManError::Corrupt(format!("invalid {what}: {s:?}")))
}

/// Parse the textual persistence format into a brand-new core.
///
/// On any corruption this returns `Err` without touching an existing
/// manager — callers are expected to only swap state in on success
/// (spec §7: "the manager must remain unmodified" on a corrupt file).
pub fn load(text: &str, rng: Box<dyn RngCore + Send>) -> Result<AddressManagerCore, AddrManError> {
    let mut lines = text.lines();

    let key_hex = next_line(&mut lines, "secret key")?;
    let key_bytes = hex::decode(key_hex.trim())
        .map_err(|e| AddrManError::Corrupt(format!("invalid secret key hex: {e}")))?;
    if key_bytes.len() != 32 {
        return Err(AddrManError::Corrupt(
            "secret key must be 32 bytes".to_string(),
        ));
    }
    let mut key_arr = [0u8; 32];
    key_arr.copy_from_slice(&key_bytes);
    let key = SecretKey(key_arr);

    let new_count = parse_usize(next_line(&mut lines, "new_count")?, "new_count")?;
    let mut tried_count = parse_usize(next_line(&mut lines, "tried_count")?, "tried_count")?;
    let buckets = parse_usize(next_line(&mut lines, "bucket count")?, "bucket count")?;
    if buckets != NEW_BUCKET_COUNT as usize {
        return Err(AddrManError::Corrupt(format!(
            "expected {NEW_BUCKET_COUNT} NEW buckets, file declares {buckets}"
        )));
    }
    if new_count > NEW_BUCKET_COUNT as usize * 64 {
        return Err(AddrManError::Corrupt("new_count out of range".to_string()));
    }
    if tried_count > TRIED_BUCKET_COUNT as usize * 64 {
        return Err(AddrManError::Corrupt(
            "tried_count out of range".to_string(),
        ));
    }

    let mut entries: HashMap<i64, ExtendedEntry> = HashMap::new();
    let mut map_addr: HashMap<IpAddr, i64> = HashMap::new();
    let mut random_order: Vec<i64> = Vec::new();
    let mut new_table = BucketMatrix::new(NEW_BUCKET_COUNT as usize);
    let mut tried_table = BucketMatrix::new(TRIED_BUCKET_COUNT as usize);

    for n in 0..new_count {
        let line = next_line(&mut lines, "NEW entry")?;
        let (peer, src) = parse_entry_line(line)?;
        let mut entry = ExtendedEntry::new(peer, src);
        entry.random_pos = random_order.len();
        let id = n as i64;
        map_addr.insert(peer.host, id);
        random_order.push(id);
        entries.insert(id, entry);
    }

    let mut id_count = new_count as i64;
    let mut lost_count = 0usize;
    for _ in 0..tried_count {
        let line = next_line(&mut lines, "TRIED entry")?;
        let (peer, src) = parse_entry_line(line)?;
        let mut entry = ExtendedEntry::new(peer, src);

        let bucket = hashing::tried_bucket(&key, &peer);
        let pos = hashing::bucket_pos(&key, &peer, false, bucket);

        if tried_table.get(bucket as usize, pos as usize).is_none() {
            let id = id_count;
            id_count += 1;
            entry.is_tried = true;
            entry.random_pos = random_order.len();
            random_order.push(id);
            map_addr.insert(peer.host, id);
            tried_table.set(bucket as usize, pos as usize, id);
            entries.insert(id, entry);
        } else {
            lost_count += 1;
        }
    }
    tried_count -= lost_count;

    for bucket in 0..NEW_BUCKET_COUNT {
        let line = next_line(&mut lines, "NEW bucket occupancy")?;
        let bucket_size = parse_usize(line, "bucket occupancy")?;
        for _ in 0..bucket_size {
            let idx_line = next_line(&mut lines, "NEW bucket member index")?;
            let index = idx_line.trim().parse::<i64>().ok();
            if let Some(index) = index {
                if index >= 0 && (index as usize) < new_count {
                    if let Some(entry) = entries.get(&index) {
                        let pos = hashing::bucket_pos(&key, &entry.peer, true, bucket);
                        let slot_free = new_table.get(bucket as usize, pos as usize).is_none();
                        if slot_free && entry.ref_count < NEW_BUCKETS_PER_ADDRESS {
                            new_table.set(bucket as usize, pos as usize, index);
                            entries.get_mut(&index).unwrap().ref_count += 1;
                        }
                    }
                }
            }
        }
    }

    let mut core = AddressManagerCore::from_parts(
        key,
        rng,
        entries,
        map_addr,
        random_order,
        new_table,
        tried_table,
        new_count,
        tried_count,
        id_count,
    );
    core.gc_orphan_new_entries();
    Ok(core)
}
