use std::sync::atomic::{AtomicU64, Ordering};

use shardnet_buffer::{Block, BlockChain, BlockPool};
use shardnet_core::Result;
use tracing::debug;

use crate::mark::Mark;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Accepts primitive and bulk writes and accumulates them in a growing chain of pool
/// blocks, with marks for back-patching.
///
/// # Growth policy
/// The first block is `initial_block_size` (default `I = 1 KiB`); once a block is full,
/// the next block is `min(2 × previous, max_block_size)`. The cap is applied on every
/// growth step, not only at the first allocation,
/// so a stream that starts tiny and then receives one huge `write_bulk` still only ever
/// allocates blocks up to `max_block_size` at a time — large writes simply span several
/// blocks instead of ballooning a single one past the cap.
pub struct BufferedOutputStream {
    id: u64,
    pool: BlockPool,
    blocks: Vec<Block>,
    max_block_size: usize,
    next_block_size: usize,
    /// Sum of `position` across every block strictly before the current (last) one.
    base_offset: usize,
    closed: bool,
}

impl BufferedOutputStream {
    pub fn new(pool: BlockPool, initial_block_size: usize, max_block_size: usize) -> Self {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            pool,
            blocks: Vec::new(),
            max_block_size,
            next_block_size: initial_block_size.max(1),
            base_offset: 0,
            closed: false,
        }
    }

    fn assert_open(&self) {
        assert!(!self.closed, "write to a closed BufferedOutputStream");
    }

    /// Total bytes written so far across the whole chain.
    pub fn written_len(&self) -> usize {
        self.base_offset + self.current_block_position()
    }

    fn current_block_position(&self) -> usize {
        self.blocks.last().map(Block::position).unwrap_or(0)
    }

    fn ensure_room(&mut self, additional: usize) {
        self.assert_open();
        let needs_new_block = match self.blocks.last() {
            Some(block) => block.remaining_mut() < additional,
            None => true,
        };
        if needs_new_block {
            if let Some(block) = self.blocks.last() {
                self.base_offset += block.position();
            }
            let size = self.next_block_size.min(self.max_block_size).max(additional);
            if size == self.max_block_size && additional > size {
                debug!(stream_id = self.id, additional, max_block_size = self.max_block_size, "write exceeds max_block_size, block grown past the cap for this one write");
            }
            let block = self.pool.acquire(size).expect("direct block allocation failed");
            self.blocks.push(block);
            self.next_block_size = (self.next_block_size.saturating_mul(2)).min(self.max_block_size);
        }
    }

    fn append(&mut self, data: &[u8]) {
        self.ensure_room(data.len());
        self.blocks
            .last_mut()
            .expect("ensure_room guarantees a block")
            .put_slice(data);
    }

    pub fn write_byte(&mut self, value: u8) {
        self.append(&[value]);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_byte(value as u8);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.append(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.append(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.append(&value.to_be_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.append(&value.to_be_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.append(&value.to_be_bytes());
    }

    pub fn write_bulk(&mut self, data: &[u8]) {
        self.append(data);
    }

    /// Transfers already-produced blocks into this stream's chain. When the incoming
    /// blocks are frozen (and therefore immutable) they are moved in by reference with
    /// no copy; a still-writable block is appended byte-for-byte, since this stream
    /// must retain exclusive, mutable ownership of its own open chain.
    pub fn write_blocks(&mut self, incoming: BlockChain) {
        self.assert_open();
        for mut block in incoming.into_vec() {
            if block.is_writable() {
                let bytes = block.as_slice().to_vec();
                self.append(&bytes);
            } else {
                if let Some(last) = self.blocks.last() {
                    self.base_offset += last.position();
                }
                self.blocks.push(block);
                self.next_block_size = self.next_block_size.min(self.max_block_size);
            }
        }
    }

    /// Null byte + compact-UTF-8-or-raw-chars framing. `None` encodes as a
    /// lone null byte with nothing following.
    pub fn write_str(&mut self, value: Option<&str>) {
        self.write_byte(if value.is_some() { 1 } else { 0 });
        let Some(s) = value else { return };

        const COMPACT_UTF8: u8 = 0;
        const RAW_CHARS: u8 = 1;

        let chooser_mark = self.mark();
        self.write_byte(COMPACT_UTF8);
        let bytes = s.as_bytes();
        if bytes.len() <= u16::MAX as usize {
            self.write_bulk(&(bytes.len() as u16).to_be_bytes());
            self.write_bulk(bytes);
        } else {
            // Probe-then-fallback : the overflow is detected by
            // comparing a length up front, never by catching a failed encode. Rewrite
            // the chooser byte through the mark we already took and re-emit as chars.
            chooser_mark.write(self, &[RAW_CHARS]);
            self.write_chars(s);
        }
    }

    /// Raw UTF-16 code-unit framing: a `u32` unit count followed by big-endian `u16`s.
    pub fn write_chars(&mut self, value: &str) {
        let units: Vec<u16> = value.encode_utf16().collect();
        self.write_i32(units.len() as i32);
        for unit in units {
            self.append(&unit.to_be_bytes());
        }
    }

    /// Captures the current position before further writes.
    pub fn mark(&self) -> Mark {
        let block_index = self.blocks.len().saturating_sub(1);
        Mark {
            stream_id: self.id,
            block_index,
            block_offset: self.current_block_position(),
            absolute_offset: self.written_len(),
        }
    }

    pub(crate) fn write_at_mark(&mut self, mark: &Mark, data: &[u8]) {
        assert_eq!(mark.stream_id, self.id, "mark used against a different stream");
        assert!(
            mark.absolute_offset + data.len() <= self.written_len(),
            "mark write extends past the stream's current written length"
        );
        let block = self
            .blocks
            .get_mut(mark.block_index)
            .expect("mark block_index is within range by construction");
        block.write_at(mark.block_offset, data);
    }

    pub(crate) fn copy_from_mark(&self, mark: &Mark, dest: &mut BufferedOutputStream, len: usize) {
        assert_eq!(mark.stream_id, self.id, "mark used against a different stream");
        assert!(
            mark.absolute_offset + len <= self.written_len(),
            "copy_to window extends past the stream's current written length"
        );
        let mut remaining = len;
        let mut block_index = mark.block_index;
        let mut offset = mark.block_offset;
        while remaining > 0 {
            let block = &self.blocks[block_index];
            let available = block.position() - offset;
            let take = available.min(remaining);
            dest.write_bulk(block.read_at(offset, take));
            remaining -= take;
            block_index += 1;
            offset = 0;
        }
    }

    /// Finalizes the current block (flips it to read mode); no further appends are
    /// accepted afterward.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for block in &mut self.blocks {
            block.freeze();
        }
        self.closed = true;
    }

    /// Returns the ordered block list ready for transmission; implies `close`.
    pub fn to_chain(mut self) -> BlockChain {
        self.close();
        self.blocks.drain(..).collect()
    }

    /// Flattens every byte written so far into an owned `Vec`, for tests and debugging.
    /// Does not close the stream.
    pub fn clone_written_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.written_len());
        for block in &self.blocks {
            if block.is_writable() {
                out.extend_from_slice(&block.as_slice()[..block.position()]);
            } else {
                // A frozen block embedded via `write_blocks` hasn't been consumed yet,
                // so its whole extent is live content.
                out.extend_from_slice(block.as_slice());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> BufferedOutputStream {
        BufferedOutputStream::new(BlockPool::new(64), 8, 64)
    }

    #[test]
    fn primitive_round_trip_layout() {
        let mut s = stream();
        s.write_bool(true);
        s.write_i32(0x1122_3344);
        s.write_str(Some("hello"));
        let chain = s.to_chain();
        let mut out = Vec::new();
        for block in chain.iter() {
            out.extend_from_slice(block.as_slice());
        }
        assert_eq!(out[0], 1); // bool=true
        assert_eq!(&out[1..5], &0x1122_3344i32.to_be_bytes());
        assert_eq!(out[5], 1); // non-null string
        assert_eq!(out[6], 0); // compact utf-8 chooser
        let len = u16::from_be_bytes([out[7], out[8]]) as usize;
        assert_eq!(len, 5);
        assert_eq!(&out[9..9 + len], b"hello");
    }

    #[test]
    fn growth_doubles_and_caps_at_max_block_size() {
        let mut s = BufferedOutputStream::new(BlockPool::new(64), 4, 16);
        // Force several block rollovers; none should ever exceed max_block_size.
        for _ in 0..20 {
            s.write_bulk(b"12345678");
        }
        let chain = s.to_chain();
        for block in chain.iter() {
            assert!(block.capacity() <= 16, "block exceeded max_block_size cap");
        }
    }

    #[test]
    fn string_overflowing_u16_length_falls_back_to_raw_chars() {
        let huge = "a".repeat(u16::MAX as usize + 10);
        let mut s = BufferedOutputStream::new(BlockPool::new(4096), 1024, 512 * 1024);
        s.write_str(Some(&huge));
        let bytes = s.clone_written_bytes();
        assert_eq!(bytes[0], 1); // non-null
        assert_eq!(bytes[1], 1); // RAW_CHARS chooser, rewritten through the mark
    }

    #[test]
    #[should_panic(expected = "write to a closed")]
    fn write_after_close_panics() {
        let mut s = stream();
        s.close();
        s.write_byte(1);
    }

    #[test]
    fn write_blocks_moves_frozen_blocks_without_copy() {
        let pool = BlockPool::new(16);
        let mut producer = BufferedOutputStream::new(pool.clone(), 32, 32);
        producer.write_bulk(b"payload");
        let produced_chain = producer.to_chain();

        let mut consumer = BufferedOutputStream::new(pool, 32, 32);
        consumer.write_bulk(b"prefix-");
        consumer.write_blocks(produced_chain);
        let bytes = consumer.clone_written_bytes();
        assert_eq!(bytes, b"prefix-payload");
    }
}
