//! Access unit buffering between the demuxer and a decoder
//!
//! The queue holds whole demuxer chunks and a read cursor. Consumed chunks
//! are kept as history, up to a configurable depth, so a video decoder can
//! rewind to the last key frame when it has to recreate its codec. The
//! demuxer side pushes from the controlling thread while the decoder worker
//! reads and advances, so every operation takes the internal lock.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::media::{AccessUnit, Chunk, StreamConfigs};
use crate::utils::error::Result;

/// Snapshot of the queue front
#[derive(Debug, Clone, Default)]
pub struct QueueInfo {
    /// Unit under the cursor
    pub front_unit: Option<Arc<AccessUnit>>,

    /// Configuration carried by the front unit's chunk, when the front unit is
    /// a config-changed marker
    pub configs: Option<Arc<StreamConfigs>>,

    /// Units at or after the cursor
    pub length: usize,

    /// Units at or after the cursor, excluding config-changed markers
    pub data_length: usize,

    /// The cursor has reached the end-of-stream unit
    pub has_eos: bool,

    /// An end-of-stream unit has been queued since the last flush
    pub eos_queued: bool,
}

/// Queue statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Chunks accepted
    pub chunks_pushed: u64,

    /// Chunks rejected because end of stream was already queued
    pub chunks_rejected: u64,

    /// Units the cursor moved past
    pub units_consumed: u64,

    /// History chunks discarded
    pub chunks_pruned: u64,

    /// Successful key frame rewinds
    pub rewinds: u64,
}

#[derive(Debug)]
struct QueuedChunk {
    units: Vec<Arc<AccessUnit>>,
    configs: Option<Arc<StreamConfigs>>,
}

#[derive(Debug)]
struct QueueInner {
    chunks: VecDeque<QueuedChunk>,
    /// Index of the chunk under the cursor; equals `chunks.len()` once all
    /// units are consumed
    current: usize,
    index_in_chunk: usize,
    length: usize,
    data_length: usize,
    eos_queued: bool,
    history_depth: usize,
    stats: QueueStats,
}

/// Thread-safe chunk queue with a read cursor and bounded history
#[derive(Debug)]
pub struct AccessUnitQueue {
    inner: Mutex<QueueInner>,
}

impl AccessUnitQueue {
    /// Create a queue retaining `history_depth` consumed chunks
    pub fn new(history_depth: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                chunks: VecDeque::new(),
                current: 0,
                index_in_chunk: 0,
                length: 0,
                data_length: 0,
                eos_queued: false,
                history_depth,
                stats: QueueStats::default(),
            }),
        }
    }

    /// Append a chunk
    ///
    /// # Returns
    ///
    /// `Ok(false)` when the chunk is empty or end of stream was already
    /// queued, `Err` when the chunk violates the chunk layout rules
    pub fn push_back(&self, chunk: Chunk) -> Result<bool> {
        chunk.validate()?;

        let mut inner = self.inner.lock();
        if inner.eos_queued {
            log::debug!("Dropping {} chunk received after end of stream", chunk.stream);
            inner.stats.chunks_rejected += 1;
            return Ok(false);
        }
        if chunk.is_empty() {
            return Ok(false);
        }

        let eos = chunk.units.last().map_or(false, |u| u.is_end_of_stream());
        let data_units = chunk.units.iter().filter(|u| !u.is_config_changed()).count();

        inner.length += chunk.units.len();
        inner.data_length += data_units;
        inner.eos_queued = eos;
        inner.stats.chunks_pushed += 1;
        inner.chunks.push_back(QueuedChunk {
            units: chunk.units.into_iter().map(Arc::new).collect(),
            configs: chunk.configs.map(Arc::new),
        });

        Ok(true)
    }

    /// Move the cursor past the front unit; a no-op on an empty queue
    pub fn advance(&self) {
        let mut inner = self.inner.lock();
        let current = inner.current;
        let index = inner.index_in_chunk;
        let (is_config, chunk_len) = match inner.chunks.get(current) {
            Some(chunk) => (chunk.units[index].is_config_changed(), chunk.units.len()),
            None => return,
        };

        inner.length -= 1;
        if !is_config {
            inner.data_length -= 1;
        }
        inner.stats.units_consumed += 1;

        inner.index_in_chunk += 1;
        if inner.index_in_chunk < chunk_len {
            return;
        }
        inner.index_in_chunk = 0;
        inner.current += 1;

        let consumed = inner.current;
        if consumed > inner.history_depth {
            let excess = consumed - inner.history_depth;
            inner.chunks.drain(..excess);
            inner.current -= excess;
            inner.stats.chunks_pruned += excess as u64;
        }
    }

    /// Snapshot of the queue front
    pub fn info(&self) -> QueueInfo {
        let inner = self.inner.lock();
        let mut info = QueueInfo {
            length: inner.length,
            data_length: inner.data_length,
            eos_queued: inner.eos_queued,
            has_eos: inner.eos_queued && inner.length <= 1,
            ..Default::default()
        };

        if let Some(chunk) = inner.chunks.get(inner.current) {
            let unit = &chunk.units[inner.index_in_chunk];
            if unit.is_config_changed() {
                info.configs = chunk.configs.clone();
            }
            info.front_unit = Some(Arc::clone(unit));
        }

        info
    }

    /// Discard everything and clear the end-of-stream state
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.chunks.clear();
        inner.current = 0;
        inner.index_in_chunk = 0;
        inner.length = 0;
        inner.data_length = 0;
        inner.eos_queued = false;
    }

    /// Move the cursor back to the closest key frame at or before it
    ///
    /// Scans the current chunk from the cursor, then the retained history.
    /// Returns false, leaving the cursor untouched, when no key frame is found.
    pub fn rewind_to_last_key_frame(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.chunks.is_empty() {
            return false;
        }

        let (start_chunk, start_index) = if inner.current < inner.chunks.len() {
            (inner.current, inner.index_in_chunk)
        } else {
            let last = inner.chunks.len() - 1;
            (last, inner.chunks[last].units.len() - 1)
        };

        for c in (0..=start_chunk).rev() {
            let units = &inner.chunks[c].units;
            let from = if c == start_chunk { start_index } else { units.len() - 1 };
            if let Some(i) = (0..=from).rev().find(|&i| units[i].is_key_frame()) {
                inner.current = c;
                inner.index_in_chunk = i;
                inner.recount();
                inner.stats.rewinds += 1;
                return true;
            }
        }

        false
    }

    pub fn len(&self) -> usize {
        self.inner.lock().length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunks currently held, history included
    pub fn retained_chunks(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats.clone()
    }
}

impl QueueInner {
    fn recount(&mut self) {
        let mut length = 0;
        let mut data_length = 0;
        for (c, chunk) in self.chunks.iter().enumerate().skip(self.current) {
            let from = if c == self.current { self.index_in_chunk } else { 0 };
            for unit in &chunk.units[from..] {
                length += 1;
                if !unit.is_config_changed() {
                    data_length += 1;
                }
            }
        }
        self.length = length;
        self.data_length = data_length;
    }
}
