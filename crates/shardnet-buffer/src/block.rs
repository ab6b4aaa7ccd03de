use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Notified when a [`Block`]'s lease ends, so the pool can reclaim the underlying
/// allocation instead of letting it drop on the floor.
///
/// Mirrors a `BufferRecycler`/`Lease` split: the block doesn't know *how*
/// it's pooled, only that something wants to hear about it when it's done.
pub(crate) trait BlockRecycler: Send + Sync + 'static {
    fn reclaim(&self, capacity: usize, storage: Option<BytesMut>);
}

enum State {
    /// Appendable; `buf.len` is the write position, `buf.capacity` the limit.
    Writable(BytesMut),
    /// Finalized; only readable and splittable from here.
    ReadOnly(Bytes),
}

/// A contiguous, pool-owned byte region with position/limit/capacity semantics. A
/// block is borrowed from a [`crate::BlockPool`] and returned to it when dropped;
/// it must never be mutated once it has been enqueued for the socket —
/// that invariant is enforced by freezing it into `ReadOnly` before enqueueing.
pub struct Block {
    state: State,
    capacity: usize,
    /// Set at `freeze` (or at construction for a split-off block) to the number of
    /// bytes actually written, as distinct from `capacity`'s original allocation size.
    /// Unused while writable. `position` subtracts the live `Bytes` length from this
    /// to know how much of the frozen extent has since been consumed or split away.
    written: usize,
    recycler: Arc<dyn BlockRecycler>,
}

impl Block {
    pub(crate) fn new(buf: BytesMut, recycler: Arc<dyn BlockRecycler>) -> Self {
        let capacity = buf.capacity();
        Self {
            state: State::Writable(buf),
            capacity,
            written: 0,
            recycler,
        }
    }

    /// Wraps already-frozen bytes as a read-only block outside of any pool, for tests and
    /// for blocks handed in by a caller through [`crate::BlockPool::wrap`].
    pub(crate) fn from_frozen(bytes: Bytes, recycler: Arc<dyn BlockRecycler>) -> Self {
        let capacity = bytes.len();
        Self {
            state: State::ReadOnly(bytes),
            capacity,
            written: capacity,
            recycler,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes already written (writable state) or already read off / split away
    /// (read-only state).
    pub fn position(&self) -> usize {
        match &self.state {
            State::Writable(buf) => buf.len(),
            State::ReadOnly(bytes) => self.written - bytes.len(),
        }
    }

    /// Extent of valid data: the original allocation size while writable, or the
    /// amount actually written once frozen.
    pub fn limit(&self) -> usize {
        match &self.state {
            State::Writable(_) => self.capacity,
            State::ReadOnly(_) => self.written,
        }
    }

    pub fn remaining_mut(&self) -> usize {
        match &self.state {
            State::Writable(buf) => buf.capacity() - buf.len(),
            State::ReadOnly(_) => 0,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.state, State::Writable(_))
    }

    /// Appends `data`, panicking if it would
    /// overrun the block's capacity or if the block has already been frozen.
    pub fn put_slice(&mut self, data: &[u8]) {
        match &mut self.state {
            State::Writable(buf) => {
                assert!(
                    buf.len() + data.len() <= buf.capacity(),
                    "write past block capacity: {} + {} > {}",
                    buf.len(),
                    data.len(),
                    buf.capacity()
                );
                buf.put_slice(data);
            }
            State::ReadOnly(_) => panic!("write to a frozen block"),
        }
    }

    /// Overwrites `len` bytes starting at `offset`, constrained to the already-written
    /// region. Panics — a boundary fault — if the write would
    /// extend past the current write position.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) {
        match &mut self.state {
            State::Writable(buf) => {
                assert!(
                    offset + data.len() <= buf.len(),
                    "mark write past already-written region: {} + {} > {}",
                    offset,
                    data.len(),
                    buf.len()
                );
                buf[offset..offset + data.len()].copy_from_slice(data);
            }
            State::ReadOnly(_) => panic!("mark write to a frozen block"),
        }
    }

    /// Reads `len` bytes starting at `offset` from the already-written region, for
    /// `Mark::copy_to`.
    pub fn read_at(&self, offset: usize, len: usize) -> &[u8] {
        match &self.state {
            State::Writable(buf) => {
                assert!(offset + len <= buf.len(), "read past written region");
                &buf[offset..offset + len]
            }
            State::ReadOnly(bytes) => {
                assert!(offset + len <= bytes.len(), "read past block extent");
                &bytes[offset..offset + len]
            }
        }
    }

    /// Finalizes the block into its read-only, transmittable form.
    /// Idempotent: freezing an already-frozen block is a no-op.
    pub fn freeze(&mut self) {
        if let State::Writable(buf) = &mut self.state {
            let frozen = std::mem::take(buf).freeze();
            self.written = frozen.len();
            self.state = State::ReadOnly(frozen);
        }
    }

    /// The readable view of this block's written bytes. Panics if still writable and
    /// not yet frozen — callers must `freeze` first.
    pub fn as_slice(&self) -> &[u8] {
        match &self.state {
            State::Writable(buf) => buf.as_ref(),
            State::ReadOnly(bytes) => bytes.as_ref(),
        }
    }

    /// Splits off the first `len` bytes as an independent read-only block sharing the
    /// same underlying storage (no copy), used when a wire envelope only needs part of
    /// a block.
    pub fn split_to(&mut self, len: usize) -> Block {
        self.freeze();
        match &mut self.state {
            State::ReadOnly(bytes) => {
                let head = bytes.split_to(len);
                Block::from_frozen(head, self.recycler.clone())
            }
            State::Writable(_) => unreachable!("freeze() above guarantees ReadOnly"),
        }
    }

    /// Remaining unread length, draining as the socket consumes bytes.
    pub fn advance(&mut self, len: usize) {
        match &mut self.state {
            State::ReadOnly(bytes) => bytes.advance(len),
            State::Writable(_) => panic!("advance on a writable block"),
        }
    }

    /// Exposes the underlying `BytesMut` so the connection's receive path can hand it
    /// straight to `tokio::io::AsyncReadExt::read_buf`, which deals with the
    /// uninitialized spare capacity internally instead of requiring `unsafe` here.
    /// Panics if the block has already been frozen.
    pub fn writable_storage(&mut self) -> &mut BytesMut {
        match &mut self.state {
            State::Writable(buf) => buf,
            State::ReadOnly(_) => panic!("writable_storage on a frozen block"),
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("capacity", &self.capacity)
            .field("position", &self.position())
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let storage = match &mut self.state {
            State::Writable(buf) => Some(std::mem::take(buf)),
            State::ReadOnly(bytes) => {
                // Only a whole, unshared, unsplit block can be recovered as a `BytesMut`
                // for reuse; a block that was split or is still aliased elsewhere is
                // dropped and the pool simply re-allocates on the next `acquire`.
                bytes.clone().try_into_mut().ok()
            }
        };
        self.recycler.reclaim(self.capacity, storage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullRecycler(AtomicUsize);
    impl BlockRecycler for NullRecycler {
        fn reclaim(&self, capacity: usize, _storage: Option<BytesMut>) {
            self.0.fetch_add(capacity, Ordering::Relaxed);
        }
    }

    fn block(capacity: usize) -> (Block, Arc<NullRecycler>) {
        let recycler = Arc::new(NullRecycler(AtomicUsize::new(0)));
        let buf = BytesMut::with_capacity(capacity);
        (Block::new(buf, recycler.clone()), recycler)
    }

    #[test]
    fn put_slice_advances_position() {
        let (mut b, _r) = block(16);
        b.put_slice(b"hello");
        assert_eq!(b.position(), 5);
        assert_eq!(b.remaining_mut(), 11);
    }

    #[test]
    #[should_panic(expected = "write past block capacity")]
    fn put_slice_past_capacity_panics() {
        let (mut b, _r) = block(4);
        b.put_slice(b"hello");
    }

    #[test]
    fn write_at_overwrites_within_written_region() {
        let (mut b, _r) = block(16);
        b.put_slice(b"XXXXX");
        b.write_at(1, b"YY");
        assert_eq!(b.as_slice(), b"XYYXX");
    }

    #[test]
    #[should_panic(expected = "mark write past already-written region")]
    fn write_at_past_written_region_panics() {
        let (mut b, _r) = block(16);
        b.put_slice(b"XX");
        b.write_at(0, b"ABCDE");
    }

    #[test]
    fn position_after_freeze_reflects_written_len_not_capacity() {
        let (mut b, _r) = block(64);
        b.put_slice(b"hello");
        b.freeze();
        assert_eq!(b.position(), 0, "freshly frozen block has nothing consumed yet");
        assert_eq!(b.limit(), 5, "limit is the written extent, not the allocation size");
        b.advance(2);
        assert_eq!(b.position(), 2);
        assert_eq!(b.as_slice(), b"llo");
    }

    #[test]
    fn freeze_then_split_shares_storage_without_copy() {
        let (mut b, _r) = block(16);
        b.put_slice(b"helloworld");
        b.freeze();
        let head = b.split_to(5);
        assert_eq!(head.as_slice(), b"hello");
        assert_eq!(b.as_slice(), b"world");
    }

    #[test]
    fn drop_reclaims_capacity() {
        let recycler = Arc::new(NullRecycler(AtomicUsize::new(0)));
        {
            let buf = BytesMut::with_capacity(32);
            let _b = Block::new(buf, recycler.clone());
        }
        assert_eq!(recycler.0.load(Ordering::Relaxed), 32);
    }
}
