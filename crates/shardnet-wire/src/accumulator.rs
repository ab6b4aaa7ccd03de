use shardnet_buffer::{Block, BlockChain, BlockPool};
use shardnet_core::Result;
use tracing::warn;

use crate::envelope::{Header, HEADER_LEN};

/// A complete logical message handed to the sink once its last envelope arrives.
pub struct Message {
    pub message_type: u8,
    pub session_id: u64,
    pub chain: BlockChain,
}

struct HeaderBuf {
    buf: [u8; HEADER_LEN],
    filled: usize,
}

impl HeaderBuf {
    fn new() -> Self {
        Self {
            buf: [0u8; HEADER_LEN],
            filled: 0,
        }
    }
}

enum State {
    AwaitHeader(HeaderBuf),
    AwaitPayload {
        header: Header,
        header_bytes: [u8; HEADER_LEN],
        /// Pool-acquired, sized to `header.payload_len`; filled incrementally across
        /// `feed` calls so a trickled near-`MAX_PAYLOAD` receive is visible to
        /// `pool.statistics().referenced` the whole time it's in flight, not just once
        /// the envelope completes.
        block: Block,
    },
}

struct Assembling {
    message_type: u8,
    session_id: u64,
    chain: BlockChain,
}

/// Per-connection receive-side state machine: `AWAIT_HEADER` ->
/// `AWAIT_PAYLOAD` -> dispatch-or-continue. One `Accumulator` belongs to exactly one
/// connection; envelopes never interleave on it.
pub struct Accumulator {
    pool: BlockPool,
    state: State,
    assembling: Option<Assembling>,
}

impl Accumulator {
    pub fn new(pool: BlockPool) -> Self {
        Self {
            pool,
            state: State::AwaitHeader(HeaderBuf::new()),
            assembling: None,
        }
    }

    /// Feeds a freshly read, already-transformed block chain into the accumulator,
    /// returning every logical message that became complete as a result. The chain may
    /// contain any number of partial or whole envelopes; the accumulator carries
    /// partial state across calls, and bytes are copied straight from each inbound
    /// block into pool-owned payload storage rather than through an intermediate
    /// heap buffer.
    pub fn feed(&mut self, chain: &BlockChain) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        for block in chain.iter() {
            self.feed_slice(block.as_slice(), &mut out)?;
        }
        Ok(out)
    }

    fn feed_slice(&mut self, mut data: &[u8], out: &mut Vec<Message>) -> Result<()> {
        while !data.is_empty() {
            match std::mem::replace(&mut self.state, State::AwaitHeader(HeaderBuf::new())) {
                State::AwaitHeader(mut hb) => {
                    let need = HEADER_LEN - hb.filled;
                    let take = need.min(data.len());
                    hb.buf[hb.filled..hb.filled + take].copy_from_slice(&data[..take]);
                    hb.filled += take;
                    data = &data[take..];
                    if hb.filled != HEADER_LEN {
                        self.state = State::AwaitHeader(hb);
                        continue;
                    }

                    let header_bytes = hb.buf;
                    let header = Header::decode(&header_bytes)?;
                    if header.payload_len == 0 {
                        self.complete_envelope(header, &header_bytes, None, out)?;
                        self.state = State::AwaitHeader(HeaderBuf::new());
                    } else {
                        let block = self.pool.acquire(header.payload_len as usize)?;
                        self.state = State::AwaitPayload {
                            header,
                            header_bytes,
                            block,
                        };
                    }
                }
                State::AwaitPayload {
                    header,
                    header_bytes,
                    mut block,
                } => {
                    let need = header.payload_len as usize - block.position();
                    let take = need.min(data.len());
                    block.put_slice(&data[..take]);
                    data = &data[take..];
                    if block.position() != header.payload_len as usize {
                        self.state = State::AwaitPayload {
                            header,
                            header_bytes,
                            block,
                        };
                        continue;
                    }

                    self.complete_envelope(header, &header_bytes, Some(block), out)?;
                    self.state = State::AwaitHeader(HeaderBuf::new());
                }
            }
        }
        Ok(())
    }

    fn complete_envelope(
        &mut self,
        header: Header,
        header_bytes: &[u8; HEADER_LEN],
        mut payload: Option<Block>,
        out: &mut Vec<Message>,
    ) -> Result<()> {
        if let Some(block) = &mut payload {
            block.freeze();
        }
        let payload_slice: &[u8] = payload.as_ref().map_or(&[][..], |b| b.as_slice());
        if let Err(err) = header.verify_checksum(header_bytes, payload_slice) {
            warn!(
                message_type = header.message_type,
                session_id = header.session_id,
                code = err.code(),
                "envelope checksum mismatch, discarding message"
            );
            // Drop any prior fragments of this message now rather than leaving their
            // blocks pinned until the caller tears the whole accumulator down.
            self.assembling = None;
            return Err(err);
        }

        let assembling = self.assembling.get_or_insert_with(|| Assembling {
            message_type: header.message_type,
            session_id: header.session_id,
            chain: BlockChain::new(),
        });
        if let Some(block) = payload {
            assembling.chain.push(block);
        }

        if !header.is_fragment() || header.is_end() {
            let assembling = self.assembling.take().expect("just inserted above");
            out.push(Message {
                message_type: assembling.message_type,
                session_id: assembling.session_id,
                chain: assembling.chain,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::encode_message;
    use shardnet_buffer::Block;

    fn flatten(chain: &BlockChain) -> Vec<u8> {
        chain.iter().flat_map(|b| b.as_slice().iter().copied()).collect()
    }

    fn encoded_bytes(pool: &BlockPool, message_type: u8, session_id: u64, payload: &[u8]) -> Vec<u8> {
        let mut body = BlockChain::new();
        let mut block: Block = pool.acquire(payload.len().max(1)).unwrap();
        block.put_slice(payload);
        body.push(block);
        let wire = encode_message(pool, message_type, session_id, body).unwrap();
        flatten(&wire)
    }

    /// Wraps raw wire bytes as a one-block chain, the shape `Accumulator::feed` now
    /// expects in place of a plain byte slice.
    fn chain_of(pool: &BlockPool, bytes: &[u8]) -> BlockChain {
        let mut block = pool.acquire(bytes.len().max(1)).unwrap();
        block.put_slice(bytes);
        block.freeze();
        let mut chain = BlockChain::new();
        chain.push(block);
        chain
    }

    #[test]
    fn single_envelope_round_trip() {
        let pool = BlockPool::new(64);
        let bytes = encoded_bytes(&pool, 3, 11, b"hello accumulator");
        let mut acc = Accumulator::new(pool.clone());
        let messages = acc.feed(&chain_of(&pool, &bytes)).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, 3);
        assert_eq!(messages[0].session_id, 11);
        assert_eq!(flatten(&messages[0].chain), b"hello accumulator");
    }

    #[test]
    fn zero_length_payload_still_dispatches() {
        let pool = BlockPool::new(64);
        let bytes = encoded_bytes(&pool, 4, 2, b"");
        let mut acc = Accumulator::new(pool.clone());
        let messages = acc.feed(&chain_of(&pool, &bytes)).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(flatten(&messages[0].chain).is_empty());
    }

    #[test]
    fn fragmented_message_dispatches_once_on_final_envelope() {
        let pool = BlockPool::new(64);
        let p = crate::envelope::MAX_PAYLOAD;
        let total = 2 * p + 37;
        let payload = vec![0x5Au8; total];
        let bytes = encoded_bytes(&pool, 9, 1, &payload);
        let mut acc = Accumulator::new(pool.clone());
        let messages = acc.feed(&chain_of(&pool, &bytes)).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(flatten(&messages[0].chain), payload);
    }

    #[test]
    fn byte_at_a_time_feed_still_assembles() {
        let pool = BlockPool::new(64);
        let bytes = encoded_bytes(&pool, 1, 1, b"trickle");
        let mut acc = Accumulator::new(pool.clone());
        let mut messages = Vec::new();
        for byte in &bytes {
            let one = chain_of(&pool, std::slice::from_ref(byte));
            messages.extend(acc.feed(&one).unwrap());
        }
        assert_eq!(messages.len(), 1);
        assert_eq!(flatten(&messages[0].chain), b"trickle");
    }

    #[test]
    fn corrupted_checksum_rejects_and_discards() {
        let pool = BlockPool::new(64);
        let mut bytes = encoded_bytes(&pool, 1, 1, b"intact");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut acc = Accumulator::new(pool.clone());
        let err = acc.feed(&chain_of(&pool, &bytes)).unwrap_err();
        assert_eq!(err.code(), shardnet_core::error::codes::WIRE_CHECKSUM_MISMATCH);
    }

    #[test]
    fn checksum_failure_on_a_later_fragment_drops_the_earlier_ones() {
        let pool = BlockPool::new(64);
        let p = crate::envelope::MAX_PAYLOAD;
        let payload = vec![0x11u8; 2 * p + 5];
        let mut bytes = encoded_bytes(&pool, 2, 1, &payload);
        // Flip a byte inside the second envelope's payload.
        let corrupt_at = crate::envelope::HEADER_LEN + p + crate::envelope::HEADER_LEN + 3;
        bytes[corrupt_at] ^= 0xFF;
        let mut acc = Accumulator::new(pool.clone());
        let err = acc.feed(&chain_of(&pool, &bytes)).unwrap_err();
        assert_eq!(err.code(), shardnet_core::error::codes::WIRE_CHECKSUM_MISMATCH);
        // The first envelope's block must not be left pinned in the pool waiting on
        // the caller to tear the accumulator down.
        assert_eq!(pool.statistics().referenced, 0);
    }
}
