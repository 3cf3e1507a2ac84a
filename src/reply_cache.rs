//! A small cache of recently seen pongs, bucketed by the number of hops they travelled. Incoming
//!  pings are answered from this cache instead of being answered by every servent in the ping's
//!  horizon.
//!
//! Bucket `k` (holding pongs with `k` hops) has capacity `base + k * increment`: pongs from
//!  further away describe a larger part of the network, so more of them are kept.
//!
//! The cache does not expire individual entries. It is cleared as a whole once its expiry window
//!  elapsed and then re-populated from fresh pongs.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::ServentConfig;
use crate::messaging::connection::ConnectionHandle;
use crate::messaging::handshake::ProtocolVersion;
use crate::messaging::payload::pong::Pong;
use crate::util::random::{Random, RngRandom};

#[derive(Debug, Clone)]
pub struct ReplyCacheEntry {
    pub pong: Pong,
    pub hops: u8,
    pub handle: Arc<dyn ConnectionHandle>,
}

struct ReplyCacheData {
    buckets: Vec<Vec<ReplyCacheEntry>>,
    expires_at: Instant,
}

pub struct ReplyCache<R: Random = RngRandom> {
    base_capacity: usize,
    capacity_increment: usize,
    expiry: Duration,
    min_version: ProtocolVersion,
    data: Mutex<ReplyCacheData>,
    _random: PhantomData<R>,
}

impl <R: Random> ReplyCache<R> {
    pub fn new(config: &ServentConfig) -> ReplyCache<R> {
        ReplyCache {
            base_capacity: config.reply_cache_base_capacity,
            capacity_increment: config.reply_cache_capacity_increment,
            expiry: config.reply_cache_expiry,
            min_version: config.reply_cache_min_version,
            data: Mutex::new(ReplyCacheData {
                buckets: vec![Vec::new(); config.reply_cache_num_hops as usize],
                expires_at: Instant::now() + config.reply_cache_expiry,
            }),
            _random: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<ReplyCacheData> {
        self.data.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn num_hops(&self) -> u8 {
        // the number of buckets is taken from a u8
        self.lock().buckets.len() as u8
    }

    fn capacity(&self, hops: u8) -> usize {
        self.base_capacity + hops as usize * self.capacity_increment
    }

    /// Adds a pong that arrived through `handle`. Returns `false` (and does nothing) if the
    ///  pong's hops are outside the cache's range, its bucket is full, or the connection's
    ///  protocol version is too old.
    pub fn add(&self, pong: Pong, hops: u8, handle: Arc<dyn ConnectionHandle>) -> bool {
        if handle.protocol_version() < self.min_version {
            trace!("not caching pong from {:?}: protocol version {}", handle, handle.protocol_version());
            return false;
        }

        let capacity = self.capacity(hops);
        let mut data = self.lock();
        let Some(bucket) = bucket_mut(&mut data.buckets, hops) else {
            return false;
        };
        if bucket.len() >= capacity {
            return false;
        }

        bucket.push(ReplyCacheEntry { pong, hops, handle });
        true
    }

    /// A uniformly random entry from the bucket for `hops`
    pub fn sample(&self, hops: u8) -> Option<ReplyCacheEntry> {
        let data = self.lock();
        let bucket = bucket(&data.buckets, hops)?;
        if bucket.is_empty() {
            return None;
        }
        Some(bucket[R::gen_usize_range(0..bucket.len())].clone())
    }

    pub fn clear(&self) {
        let mut data = self.lock();
        for bucket in data.buckets.iter_mut() {
            bucket.clear();
        }
        data.expires_at = Instant::now() + self.expiry;
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.lock().expires_at
    }

    pub fn len(&self) -> usize {
        self.lock().buckets.iter()
            .map(|b| b.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn bucket(buckets: &[Vec<ReplyCacheEntry>], hops: u8) -> Option<&Vec<ReplyCacheEntry>> {
    if hops == 0 {
        return None;
    }
    buckets.get(hops as usize - 1)
}

fn bucket_mut(buckets: &mut [Vec<ReplyCacheEntry>], hops: u8) -> Option<&mut Vec<ReplyCacheEntry>> {
    if hops == 0 {
        return None;
    }
    buckets.get_mut(hops as usize - 1)
}

/// Periodically clears the cache once it is expired. Runs until the task is aborted.
pub async fn run_reply_cache_housekeeping<R: Random>(cache: Arc<ReplyCache<R>>, interval: Duration) {
    let mut ticks = time::interval(interval);
    loop {
        ticks.tick().await;
        if cache.is_expired() {
            debug!("reply cache expired, discarding {} entries", cache.len());
            cache.clear();
        }
    }
}
