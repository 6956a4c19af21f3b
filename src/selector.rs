//! Work-item selection.
//!
//! A selector turns a worker's claimed index into the item it should load.
//! [`Sequential`] maps the index straight into a fixed list, [`RandomPick`]
//! ignores it and draws from the list, and [`WindowedRandom`] draws block
//! numbers below a bound that is re-fetched from the target at most once per
//! refresh interval.

use crate::error::{Error, Result};
use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

// =============================================================================
// Shared RNG
// =============================================================================

/// Process-wide random source shared by all workers.
pub struct LockedRng {
    inner: Mutex<StdRng>,
}

impl LockedRng {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Uniform draw from `0..n`; returns 0 when `n == 0`.
    pub fn below(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let mut rng = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        rng.random_range(0..n)
    }

    pub fn shuffle<T>(&self, items: &mut [T]) {
        let mut rng = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        items.shuffle(&mut *rng);
    }
}

impl Default for LockedRng {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Selector contract
// =============================================================================

pub trait WorkItemSelector: Send + Sync {
    type Item: Send;

    /// Chooses the item for the worker holding `index`.
    fn pick(&self, index: usize) -> impl Future<Output = Result<Self::Item>> + Send;
}

/// Source of the moving upper bound used by [`WindowedRandom`].
pub trait BoundSource: Send + Sync {
    fn latest(&self) -> impl Future<Output = Result<i32>> + Send;
}

impl<F, Fut> BoundSource for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<i32>> + Send,
{
    fn latest(&self) -> impl Future<Output = Result<i32>> + Send {
        self()
    }
}

// =============================================================================
// Fixed lists
// =============================================================================

/// Returns `items[index % len]`, so the list is cycled when indices run past it.
pub struct Sequential<T> {
    items: Arc<[T]>,
}

impl<T: Clone + Send + Sync> Sequential<T> {
    pub fn new(items: Vec<T>) -> Result<Self> {
        if items.is_empty() {
            return Err(Error::NoWorkItems);
        }
        Ok(Self {
            items: items.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Clone + Send + Sync> WorkItemSelector for Sequential<T> {
    type Item = T;

    fn pick(&self, index: usize) -> impl Future<Output = Result<T>> + Send {
        let item = self.items[index % self.items.len()].clone();
        async move { Ok(item) }
    }
}

/// Uniform random choice from a fixed list.
pub struct RandomPick<T> {
    items: Arc<[T]>,
    rng: Arc<LockedRng>,
}

impl<T: Clone + Send + Sync> RandomPick<T> {
    pub fn new(items: Vec<T>, rng: Arc<LockedRng>) -> Result<Self> {
        if items.is_empty() {
            return Err(Error::NoWorkItems);
        }
        Ok(Self {
            items: items.into(),
            rng,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Clone + Send + Sync> WorkItemSelector for RandomPick<T> {
    type Item = T;

    fn pick(&self, _index: usize) -> impl Future<Output = Result<T>> + Send {
        let item = self.items[self.rng.below(self.items.len())].clone();
        async move { Ok(item) }
    }
}

// =============================================================================
// Block ranges
// =============================================================================

/// `last:N` (window below the moving head) or `range:FROM-TO` (closed range).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRange {
    Last { count: i32 },
    Range { from: i32, to: i32 },
}

impl FromStr for BlockRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let spec = s.trim().to_ascii_lowercase();
        let invalid = |reason| Error::InvalidBlockRange {
            spec: s.to_string(),
            reason,
        };
        if spec.is_empty() {
            return Err(invalid("empty"));
        }
        if let Some(n) = spec.strip_prefix("last:") {
            let count: i32 = n.trim().parse().map_err(|_| invalid("invalid last:N"))?;
            if count <= 0 {
                return Err(invalid("invalid last:N"));
            }
            return Ok(BlockRange::Last { count });
        }
        if let Some(pair) = spec.strip_prefix("range:") {
            let (from, to) = pair.split_once('-').ok_or_else(|| invalid("invalid range"))?;
            let from: i32 = from.trim().parse().map_err(|_| invalid("invalid range values"))?;
            let to: i32 = to.trim().parse().map_err(|_| invalid("invalid range values"))?;
            if from <= 0 || to <= 0 || from > to {
                return Err(invalid("invalid range values"));
            }
            return Ok(BlockRange::Range { from, to });
        }
        Err(invalid("unknown spec"))
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRange::Last { count } => write!(f, "last:{count}"),
            BlockRange::Range { from, to } => write!(f, "range:{from}-{to}"),
        }
    }
}

/// First sequence number of a `window`-wide window ending at `bound`, never below 1.
fn window_start(bound: i32, window: i32) -> i32 {
    (bound as i64 - window as i64 + 1).max(1) as i32
}

/// Rejects a head below block 1, which would leave the window empty.
fn checked_bound(latest: i32) -> Result<i32> {
    if latest < 1 {
        return Err(Error::BoundFetch(format!("bound {latest} is below 1")));
    }
    Ok(latest)
}

/// Expands a range into the explicit list of sequence numbers, asking `source`
/// for the head when the range is `last:N`.
pub async fn resolve_block_list<S: BoundSource>(source: &S, range: BlockRange) -> Result<Vec<i32>> {
    let (from, to) = match range {
        BlockRange::Range { from, to } => (from, to),
        BlockRange::Last { count } => {
            let last = checked_bound(source.latest().await?)?;
            (window_start(last, count), last)
        }
    };
    Ok((from..=to).collect())
}

// =============================================================================
// Windowed random
// =============================================================================

#[derive(Default)]
struct CachedBound {
    latest: Option<i32>,
    refreshed_at: Option<Instant>,
}

/// Random block numbers in `[max(1, bound-window+1), bound]`, where `bound`
/// is cached and re-fetched once it is older than `refresh`.
///
/// A zero `refresh` fetches the bound once and keeps it. For a closed
/// [`BlockRange::Range`] no bound is ever fetched.
pub struct WindowedRandom<S> {
    source: S,
    range: BlockRange,
    refresh: Duration,
    rng: Arc<LockedRng>,
    cache: tokio::sync::Mutex<CachedBound>,
}

impl<S: BoundSource> WindowedRandom<S> {
    pub fn new(source: S, range: BlockRange, refresh: Duration, rng: Arc<LockedRng>) -> Self {
        Self {
            source,
            range,
            refresh,
            rng,
            cache: tokio::sync::Mutex::new(CachedBound::default()),
        }
    }

    async fn bound(&self) -> Result<i32> {
        let mut cache = self.cache.lock().await;
        let now = Instant::now();
        let stale = match (cache.latest, cache.refreshed_at) {
            (Some(_), Some(at)) => {
                !self.refresh.is_zero() && now.duration_since(at) >= self.refresh
            }
            _ => true,
        };
        if stale {
            let latest = checked_bound(self.source.latest().await?)?;
            debug!("block bound refreshed: {}", latest);
            cache.latest = Some(latest);
            cache.refreshed_at = Some(now);
        }
        cache
            .latest
            .ok_or_else(|| Error::BoundFetch("bound unavailable".into()))
    }

    fn draw(&self, from: i32, to: i32) -> i32 {
        let span = to as i64 - from as i64 + 1;
        if span <= 1 {
            return to;
        }
        (from as i64 + self.rng.below(span as usize) as i64) as i32
    }
}

impl<S: BoundSource> WorkItemSelector for WindowedRandom<S> {
    type Item = i32;

    async fn pick(&self, _index: usize) -> Result<i32> {
        match self.range {
            BlockRange::Range { from, to } => Ok(self.draw(from, to)),
            BlockRange::Last { count } => {
                let bound = self.bound().await?;
                Ok(self.draw(window_start(bound, count), bound))
            }
        }
    }
}
