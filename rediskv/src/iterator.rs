//! Buffered cursor iteration over a store's key range.
//!
//! A [`BufferedIterator`] fetches entries in batches of up to
//! `high_water_mark`, serves reads from its buffer, and resumes each fetch
//! just past the last key it saw. The three iterator shapes differ only in
//! their [`FetchStrategy`]: what the server returns per entry and how it is
//! decoded.
//!
//! Every iterator holds a cancellation token derived from its store. Closing
//! the iterator, calling [`IteratorCloser::close`], or closing the store
//! makes every later read return the end-of-iteration signal. A fetch that
//! is in flight when that happens completes, but its entries are dropped.

use std::collections::VecDeque;
use std::marker::PhantomData;

use bytes::Bytes;
use common::{FetchedRange, Projection};
use tokio_util::sync::CancellationToken;

use crate::config::{ALL_BATCH_SIZE, ScanOptions};
use crate::error::{Error, Result};
use crate::model::KeyValueEntry;
use crate::range::ScanRange;
use crate::storage::KeyValueStorage;

/// The fetch shape of an iterator: which projection it asks the server for
/// and how a fetched batch becomes items.
pub trait FetchStrategy: Send + Sync + 'static {
    type Item: Send;

    const PROJECTION: Projection;

    fn decode(fetched: FetchedRange) -> Result<Vec<Self::Item>>;
}

/// Yields [`KeyValueEntry`] items.
pub struct Pairs;

/// Yields keys; values are never read.
pub struct KeysOnly;

/// Yields values in key order.
pub struct ValuesOnly;

impl FetchStrategy for Pairs {
    type Item = KeyValueEntry;

    const PROJECTION: Projection = Projection::Pairs;

    fn decode(fetched: FetchedRange) -> Result<Vec<KeyValueEntry>> {
        let pairs = match fetched {
            FetchedRange::Pairs(pairs) => pairs,
            other => return Err(unexpected(Self::PROJECTION, &other)),
        };
        Ok(pairs
            .into_iter()
            .filter_map(|(key, value)| match value {
                Some(value) => Some(KeyValueEntry::new(key, value)),
                None => {
                    tracing::warn!(key = ?key, "skipping key with no stored value");
                    None
                }
            })
            .collect())
    }
}

impl FetchStrategy for KeysOnly {
    type Item = Bytes;

    const PROJECTION: Projection = Projection::Keys;

    fn decode(fetched: FetchedRange) -> Result<Vec<Bytes>> {
        match fetched {
            FetchedRange::Keys(keys) => Ok(keys),
            other => Err(unexpected(Self::PROJECTION, &other)),
        }
    }
}

impl FetchStrategy for ValuesOnly {
    type Item = Bytes;

    const PROJECTION: Projection = Projection::Values;

    fn decode(fetched: FetchedRange) -> Result<Vec<Bytes>> {
        let values = match fetched {
            FetchedRange::Values { values, .. } => values,
            other => return Err(unexpected(Self::PROJECTION, &other)),
        };
        let fetched = values.len();
        let values: Vec<Bytes> = values.into_iter().flatten().collect();
        if values.len() < fetched {
            tracing::warn!(
                skipped = fetched - values.len(),
                "skipping keys with no stored value"
            );
        }
        Ok(values)
    }
}

fn unexpected(projection: Projection, fetched: &FetchedRange) -> Error {
    Error::Internal(format!(
        "{:?} fetch returned a mismatched reply: {:?}",
        projection, fetched
    ))
}

/// Iterator over key-value entries.
pub type KeyValueIterator = BufferedIterator<Pairs>;

/// Iterator over keys.
pub type KeyIterator = BufferedIterator<KeysOnly>;

/// Iterator over values.
pub type ValueIterator = BufferedIterator<ValuesOnly>;

/// Ends an iterator from outside, e.g. from another task while the
/// iterator is waiting on a fetch.
#[derive(Debug, Clone)]
pub struct IteratorCloser {
    token: CancellationToken,
}

impl IteratorCloser {
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Pull-based, prefetching cursor over one scan range.
///
/// Calls on one iterator must not overlap; `&mut self` enforces this.
pub struct BufferedIterator<S: FetchStrategy> {
    storage: KeyValueStorage,
    /// Range as constructed; reseeks are taken relative to it.
    origin: ScanRange,
    /// Range still to fetch.
    range: ScanRange,
    buffer: VecDeque<S::Item>,
    high_water_mark: usize,
    /// Entries the scan may still fetch; `None` is unbounded.
    remaining: Option<usize>,
    /// No further fetch will return entries.
    done: bool,
    cancel: CancellationToken,
    strategy: PhantomData<S>,
}

impl<S: FetchStrategy> BufferedIterator<S> {
    pub(crate) fn new(
        storage: KeyValueStorage,
        options: &ScanOptions,
        default_high_water_mark: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let range = ScanRange::from_options(options)?;
        let high_water_mark = options.high_water_mark.unwrap_or(default_high_water_mark);
        if high_water_mark == 0 {
            return Err(Error::InvalidArgument(
                "high_water_mark must be a positive integer".to_string(),
            ));
        }
        Ok(Self {
            storage,
            origin: range.clone(),
            range,
            buffer: VecDeque::new(),
            high_water_mark,
            remaining: options.limit,
            done: options.limit == Some(0),
            cancel,
            strategy: PhantomData,
        })
    }

    /// Returns the next item, or `None` once the scan is exhausted or the
    /// iterator has been closed.
    pub async fn next(&mut self) -> Result<Option<S::Item>> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.done {
                return Ok(None);
            }
            self.fill().await?;
        }
    }

    /// Returns up to `n` items, fetching as often as needed. Fewer than `n`
    /// items means the scan is exhausted; an empty result means nothing is
    /// left or the iterator was closed.
    pub async fn next_batch(&mut self, n: usize) -> Result<Vec<S::Item>> {
        let mut items = Vec::with_capacity(n.min(self.high_water_mark));
        while items.len() < n && !self.cancel.is_cancelled() {
            if self.buffer.is_empty() {
                if self.done {
                    break;
                }
                if let Err(e) = self.fill().await {
                    // Keep already collected items readable after a failed fetch.
                    for item in items.into_iter().rev() {
                        self.buffer.push_front(item);
                    }
                    return Err(e);
                }
                continue;
            }
            let take = (n - items.len()).min(self.buffer.len());
            items.extend(self.buffer.drain(..take));
        }
        if self.cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        Ok(items)
    }

    /// Collects every remaining item.
    ///
    /// Holds the whole result in memory; use it on bounded ranges only.
    pub async fn all(&mut self) -> Result<Vec<S::Item>> {
        let mut items = Vec::new();
        loop {
            let batch = self.next_batch(ALL_BATCH_SIZE).await?;
            if batch.is_empty() {
                return Ok(items);
            }
            items.extend(batch);
        }
    }

    /// Repositions the scan at `target` (inclusive).
    ///
    /// The seek stays within the range the iterator was created with: a
    /// target outside it restarts at the original start, and the end bound
    /// is unchanged. Buffered items are dropped and no longer count against
    /// the limit.
    pub fn seek(&mut self, target: impl Into<Bytes>) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining += self.buffer.len();
        }
        self.buffer.clear();
        self.range = self.origin.seek(target.into());
        self.done = self.remaining == Some(0);
    }

    /// Ends the iteration. Safe to call more than once.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.buffer.clear();
        self.done = true;
    }

    /// A handle that ends this iterator from elsewhere.
    pub fn closer(&self) -> IteratorCloser {
        IteratorCloser {
            token: self.cancel.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn fill(&mut self) -> Result<()> {
        let count = match self.remaining {
            Some(remaining) => remaining.min(self.high_water_mark),
            None => self.high_water_mark,
        };
        if count == 0 {
            self.done = true;
            return Ok(());
        }

        let fetched = self.storage.fetch(S::PROJECTION, &self.range, count).await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let fetched = fetched?;

        if fetched.len() < count {
            self.done = true;
        }
        if let Some(last) = fetched.last_key() {
            self.range.resume_after(last.clone());
        }
        let items = S::decode(fetched)?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(items.len());
            if *remaining == 0 {
                self.done = true;
            }
        }
        tracing::trace!(count, buffered = items.len(), done = self.done, "fetched range");
        self.buffer.extend(items);
        Ok(())
    }
}
