//! Reply routing: remembers which connection a request came from so that replies carrying the
//!  same identifier can be sent back along the reverse path.
//!
//! Entries live in two maps, 'new' and 'old'. Once per window (or when the new map grows beyond
//!  its size limit), the old map is discarded and the new map becomes the old one. An entry
//!  therefore survives between one and two windows without per-entry timestamps, and memory is
//!  bounded by roughly twice the volume of one window.
//!
//! Entries refer to connections through small integer ids rather than directly. Forgetting a
//!  closed connection removes its id mapping in O(1), and all entries with that id resolve to
//!  nothing from then on - exactly as if the identifier had never been seen. The entries
//!  themselves stay in place until they age out, so they still suppress duplicates.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::messaging::connection::{ConnectionHandle, HandleKey};
use crate::messaging::guid::Guid;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RouteEntry {
    pub handler_id: u32,
    pub bytes_routed: u64,
    pub replies_routed: u32,
    /// advisory TTL for extending a query's reach, set at most once per entry
    pub ttl: Option<u8>,
}

impl RouteEntry {
    fn new(handler_id: u32) -> RouteEntry {
        RouteEntry {
            handler_id,
            bytes_routed: 0,
            replies_routed: 0,
            ttl: None,
        }
    }
}

/// The result of a successful [RouteTable::lookup_and_account]: the connection to send a reply
///  to, and the volume routed for this identifier *before* the reply was accounted for.
#[derive(Debug, Clone)]
pub struct ReplyRoute {
    pub handle: Arc<dyn ConnectionHandle>,
    pub bytes_routed: u64,
    pub replies_routed: u32,
}

struct RouteTableData {
    new_map: FxHashMap<Guid, RouteEntry>,
    old_map: FxHashMap<Guid, RouteEntry>,
    next_switch: Instant,
    handler_ids: FxHashMap<HandleKey, u32>,
    handlers: FxHashMap<u32, Arc<dyn ConnectionHandle>>,
    next_id: u32,
}

impl RouteTableData {
    fn purge(&mut self, name: &str, window: Duration, max_size: usize) {
        let now = Instant::now();
        if now < self.next_switch && self.new_map.len() < max_size {
            return;
        }

        trace!("{}: rotating route table, discarding {} entries", name, self.old_map.len());
        self.old_map.clear();
        std::mem::swap(&mut self.old_map, &mut self.new_map);
        self.next_switch = now + window;
    }

    fn handler_id(&mut self, handle: &Arc<dyn ConnectionHandle>) -> u32 {
        if let Some(id) = self.handler_ids.get(&handle.key()) {
            return *id;
        }

        let id = loop {
            let candidate = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.handlers.contains_key(&candidate) {
                break candidate;
            }
        };
        self.handler_ids.insert(handle.key(), id);
        self.handlers.insert(id, handle.clone());
        id
    }

    fn get_mut(&mut self, guid: &Guid) -> Option<&mut RouteEntry> {
        match self.new_map.get_mut(guid) {
            Some(entry) => Some(entry),
            None => self.old_map.get_mut(guid),
        }
    }

    fn get(&self, guid: &Guid) -> Option<&RouteEntry> {
        self.new_map.get(guid)
            .or_else(|| self.old_map.get(guid))
    }

    fn contains(&self, guid: &Guid) -> bool {
        self.new_map.contains_key(guid) || self.old_map.contains_key(guid)
    }
}

pub struct RouteTable {
    name: &'static str,
    window: Duration,
    max_size: usize,
    data: Mutex<RouteTableData>,
}

impl RouteTable {
    pub fn new(name: &'static str, window: Duration, max_size: usize) -> RouteTable {
        RouteTable {
            name,
            window,
            max_size,
            data: Mutex::new(RouteTableData {
                new_map: Default::default(),
                old_map: Default::default(),
                next_switch: Instant::now() + window,
                handler_ids: Default::default(),
                handlers: Default::default(),
                next_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<RouteTableData> {
        self.data.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds `guid` to `handle`, moving an existing entry (with its counters) to the new map. This
    ///  renews the entry's lifetime. Returns `None` without touching the table if `handle` is
    ///  closed.
    pub fn route_reply(&self, guid: Guid, handle: &Arc<dyn ConnectionHandle>) -> Option<RouteEntry> {
        if !handle.is_open() {
            return None;
        }

        let mut data = self.lock();
        data.purge(self.name, self.window, self.max_size);

        let id = data.handler_id(handle);
        let mut entry = data.new_map.remove(&guid)
            .or_else(|| data.old_map.remove(&guid))
            .unwrap_or_else(|| RouteEntry::new(id));
        entry.handler_id = id;
        data.new_map.insert(guid, entry);
        Some(entry)
    }

    /// Binds `guid` to `handle` only if the identifier is not known yet. `None` signals a
    ///  duplicate (or a closed handle).
    pub fn try_route(&self, guid: Guid, handle: &Arc<dyn ConnectionHandle>) -> Option<RouteEntry> {
        if !handle.is_open() {
            return None;
        }

        let mut data = self.lock();
        data.purge(self.name, self.window, self.max_size);

        if data.contains(&guid) {
            return None;
        }

        let entry = RouteEntry::new(data.handler_id(handle));
        data.new_map.insert(guid, entry);
        Some(entry)
    }

    /// The connection replies for `guid` should go to. Unknown identifiers and identifiers
    ///  bound to a forgotten connection both return `None`.
    pub fn lookup(&self, guid: &Guid) -> Option<Arc<dyn ConnectionHandle>> {
        let data = self.lock();
        let entry = data.get(guid)?;
        data.handlers.get(&entry.handler_id).cloned()
    }

    /// Like [RouteTable::lookup], and adds a reply's size to the entry's counters. The returned
    ///  counters are the values before adding.
    pub fn lookup_and_account(&self, guid: &Guid, bytes: u64, replies: u32) -> Option<ReplyRoute> {
        let mut data = self.lock();
        let entry = *data.get(guid)?;
        let handle = data.handlers.get(&entry.handler_id)?.clone();

        if let Some(entry) = data.get_mut(guid) {
            entry.bytes_routed = entry.bytes_routed.saturating_add(bytes);
            entry.replies_routed = entry.replies_routed.saturating_add(replies);
        }

        Some(ReplyRoute {
            handle,
            bytes_routed: entry.bytes_routed,
            replies_routed: entry.replies_routed,
        })
    }

    /// Drops the mapping for a (closed) connection. Entries referring to it are left in place.
    pub fn forget(&self, key: HandleKey) {
        let mut data = self.lock();
        if let Some(id) = data.handler_ids.remove(&key) {
            data.handlers.remove(&id);
            debug!("{}: forgot connection {:?} (id {})", self.name, key, id);
        }
    }

    /// Sets an entry's TTL if it has none yet. Returns `false` for unknown identifiers, entries
    ///  that already have a TTL, and a TTL of 0.
    pub fn set_ttl(&self, guid: &Guid, ttl: u8) -> bool {
        if ttl == 0 {
            return false;
        }

        let mut data = self.lock();
        match data.get_mut(guid) {
            Some(entry) if entry.ttl.is_none() => {
                entry.ttl = Some(ttl);
                true
            }
            _ => false,
        }
    }

    /// Atomically replaces an entry's TTL if it currently is `expected`. `new_ttl` must be larger
    ///  than `expected`, and `expected` must be positive; otherwise nothing is changed.
    pub fn set_if_ttl_equals(&self, guid: &Guid, expected: u8, new_ttl: u8) -> bool {
        if expected < 1 || new_ttl <= expected {
            debug!("{}: invalid TTL update {} -> {} for {:?}", self.name, expected, new_ttl, guid);
            return false;
        }

        let mut data = self.lock();
        match data.get_mut(guid) {
            Some(entry) if entry.ttl == Some(expected) => {
                entry.ttl = Some(new_ttl);
                true
            }
            _ => false,
        }
    }

    pub fn ttl(&self, guid: &Guid) -> Option<u8> {
        self.lock()
            .get(guid)?
            .ttl
    }

    pub fn entry(&self, guid: &Guid) -> Option<RouteEntry> {
        self.lock()
            .get(guid)
            .copied()
    }

    /// the number of entries in both maps, including entries of forgotten connections
    pub fn len(&self) -> usize {
        let data = self.lock();
        data.new_map.len() + data.old_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for RouteTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let data = self.lock();

        let mut both: BTreeMap<Guid, &RouteEntry> = data.old_map.iter()
            .map(|(guid, entry)| (*guid, entry))
            .collect();
        both.extend(data.new_map.iter().map(|(guid, entry)| (*guid, entry)));

        write!(f, "{}{{", self.name)?;
        for (i, (guid, entry)) in both.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match data.handlers.get(&entry.handler_id) {
                Some(handle) => write!(f, "{}->{:?}", guid, handle)?,
                None => write!(f, "{}->null", guid)?,
            }
        }
        write!(f, "}}")
    }
}
