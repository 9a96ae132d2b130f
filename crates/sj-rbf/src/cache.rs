//! Page cache tuned for reverse scans.
//!
//! Slots are fixed-size pages in one flat buffer, described by parallel
//! `page_of`/`valid_len` arrays. Lookup is a linear scan over at most 64
//! slots and a hit touches no bookkeeping. Eviction is circular FIFO: the
//! dominant access pattern walks backward through the file once, so recency
//! tracking would buy nothing.
//!
//! A miss reads a block of up to `read_block_pages` pages that *ends* at the
//! missed page, extending downward over pages not already cached, so a
//! reverse walk pays one read per block rather than one per page. A block
//! that would run past the end of the slot array is staged in a scratch
//! buffer and copied into the wrapped slots.
//!
//! The cache does not own the file handle and never invalidates: build it
//! over a stream that does not change while the cache is alive. A short read
//! at end of file is cached with a shortened `valid_len`, so a cache kept
//! across appends would miss the new bytes.

use std::io;

use serde::{Deserialize, Serialize};

use crate::error::{RbfError, Result};
use crate::source::RandomRead;

const NO_PAGE: u64 = u64::MAX;

/// Geometry of a [`ReadCache`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadCacheConfig {
    /// Bytes per page. Power of two in `[512, 1 MiB]`.
    pub page_size: usize,
    /// Number of page slots, `1..=64`.
    pub slot_count: usize,
    /// Pages fetched per miss, `1..=slot_count`.
    pub read_block_pages: usize,
}

impl ReadCacheConfig {
    pub const MIN_PAGE_SIZE: usize = 512;
    pub const MAX_PAGE_SIZE: usize = 1 << 20;
    pub const MAX_SLOTS: usize = 64;

    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < Self::MIN_PAGE_SIZE
            || self.page_size > Self::MAX_PAGE_SIZE
        {
            return Err(RbfError::InvalidConfig(format!(
                "page_size {} must be a power of two in [{}, {}]",
                self.page_size,
                Self::MIN_PAGE_SIZE,
                Self::MAX_PAGE_SIZE
            )));
        }
        if self.slot_count == 0 || self.slot_count > Self::MAX_SLOTS {
            return Err(RbfError::InvalidConfig(format!(
                "slot_count {} must be in [1, {}]",
                self.slot_count,
                Self::MAX_SLOTS
            )));
        }
        if self.read_block_pages == 0 || self.read_block_pages > self.slot_count {
            return Err(RbfError::InvalidConfig(format!(
                "read_block_pages {} must be in [1, slot_count = {}]",
                self.read_block_pages, self.slot_count
            )));
        }
        Ok(())
    }
}

impl Default for ReadCacheConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            slot_count: 16,
            read_block_pages: 4,
        }
    }
}

/// Counters for observing cache behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Block reads issued against the underlying source.
    pub source_reads: u64,
}

/// Reverse-tuned page cache over a [`RandomRead`] source.
pub struct ReadCache<R> {
    source: R,
    page_shift: u32,
    page_size: usize,
    block_pages: usize,
    pages: Vec<u8>,
    page_of: Vec<u64>,
    valid_len: Vec<usize>,
    next_slot: usize,
    scratch: Vec<u8>,
    stats: CacheStats,
}

impl<R: RandomRead> ReadCache<R> {
    pub fn new(source: R, config: &ReadCacheConfig) -> Result<Self> {
        config.validate()?;
        let slots = config.slot_count;
        Ok(Self {
            source,
            page_shift: config.page_size.trailing_zeros(),
            page_size: config.page_size,
            block_pages: config.read_block_pages,
            pages: vec![0; slots * config.page_size],
            page_of: vec![NO_PAGE; slots],
            valid_len: vec![0; slots],
            next_slot: 0,
            scratch: Vec::new(),
            stats: CacheStats::default(),
        })
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn slot_count(&self) -> usize {
        self.page_of.len()
    }

    /// Returns `true` if page number `page` currently occupies a slot.
    pub fn is_cached(&self, page: u64) -> bool {
        self.lookup(page).is_some()
    }

    /// Forget every cached page.
    pub fn clear(&mut self) {
        self.page_of.fill(NO_PAGE);
        self.valid_len.fill(0);
        self.next_slot = 0;
    }

    pub fn into_inner(self) -> R {
        self.source
    }

    fn lookup(&self, page: u64) -> Option<usize> {
        self.page_of.iter().position(|&p| p == page)
    }

    /// Load the block ending at `page`. Returns its slot, or `None` if the
    /// page lies entirely past end of file.
    fn fill(&mut self, page: u64) -> io::Result<Option<usize>> {
        let slots = self.page_of.len();
        let ps = self.page_size;

        let mut first = page;
        while ((page - first) as usize) + 1 < self.block_pages
            && first > 0
            && self.lookup(first - 1).is_none()
        {
            first -= 1;
        }
        let count = (page - first) as usize + 1;
        let start = self.next_slot;

        for i in 0..count {
            let slot = (start + i) % slots;
            self.page_of[slot] = NO_PAGE;
            self.valid_len[slot] = 0;
        }

        let offset = first << self.page_shift;
        let bytes = count * ps;
        let read = if start + count <= slots {
            let at = start * ps;
            self.source.read_full_at(offset, &mut self.pages[at..at + bytes])?
        } else {
            self.scratch.resize(bytes, 0);
            let read = self.source.read_full_at(offset, &mut self.scratch[..bytes])?;
            for i in 0..count {
                let at = ((start + i) % slots) * ps;
                self.pages[at..at + ps].copy_from_slice(&self.scratch[i * ps..(i + 1) * ps]);
            }
            read
        };
        self.stats.source_reads += 1;
        self.next_slot = (start + count) % slots;

        let mut target = None;
        for i in 0..count {
            let valid = read.saturating_sub(i * ps).min(ps);
            if valid == 0 {
                break;
            }
            let slot = (start + i) % slots;
            self.page_of[slot] = first + i as u64;
            self.valid_len[slot] = valid;
            if first + i as u64 == page {
                target = Some(slot);
            }
        }
        Ok(target)
    }
}

impl<R: RandomRead> RandomRead for ReadCache<R> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mask = self.page_size as u64 - 1;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let page = pos >> self.page_shift;
            let in_page = (pos & mask) as usize;

            let slot = match self.lookup(page) {
                Some(slot) => {
                    self.stats.hits += 1;
                    slot
                }
                None => {
                    self.stats.misses += 1;
                    match self.fill(page)? {
                        Some(slot) => slot,
                        None => break,
                    }
                }
            };

            let valid = self.valid_len[slot];
            if in_page >= valid {
                break;
            }
            let n = (valid - in_page).min(buf.len() - done);
            let at = slot * self.page_size + in_page;
            buf[done..done + n].copy_from_slice(&self.pages[at..at + n]);
            done += n;

            // A partially valid page is the last page of the source.
            if in_page + n < self.page_size && done < buf.len() {
                break;
            }
        }
        Ok(done)
    }
}
