use std::collections::VecDeque;

use shardnet_buffer::{Block, BlockChain, BlockPool};
use shardnet_core::Result;
use tracing::debug;

use crate::envelope::{Header, FLAG_END, FLAG_FRAGMENT, HEADER_LEN, MAX_PAYLOAD};

/// Chops a logical message's block chain into one or more wire envelopes. A header-sized block is acquired from the pool for each envelope;
/// payload blocks are moved in by reference (split, not copied) when an envelope
/// boundary falls inside an existing block.
pub fn encode_message(
    pool: &BlockPool,
    message_type: u8,
    session_id: u64,
    mut body: BlockChain,
) -> Result<BlockChain> {
    body.freeze_all();
    let total_len = body.total_len();
    let envelope_count = if total_len <= MAX_PAYLOAD {
        1
    } else {
        (total_len + MAX_PAYLOAD - 1) / MAX_PAYLOAD
    };

    if envelope_count > 1 {
        debug!(message_type, session_id, envelope_count, total_len, "message fragments across envelopes");
    }

    let mut remaining_blocks: VecDeque<Block> = body.into_vec().into_iter().collect();
    let mut out = BlockChain::new();
    let mut consumed = 0usize;

    for envelope_index in 0..envelope_count {
        let take_len = if envelope_index + 1 == envelope_count {
            total_len - consumed
        } else {
            MAX_PAYLOAD
        };

        let mut payload_blocks = Vec::new();
        let mut need = take_len;
        while need > 0 {
            let front = remaining_blocks
                .front_mut()
                .expect("remaining byte count tracks remaining_blocks by construction");
            let available = front.as_slice().len();
            if available <= need {
                payload_blocks.push(remaining_blocks.pop_front().unwrap());
                need -= available;
            } else {
                payload_blocks.push(front.split_to(need));
                need = 0;
            }
        }
        consumed += take_len;

        let mut flags = 0u16;
        if envelope_count > 1 {
            flags |= FLAG_FRAGMENT;
            if envelope_index + 1 == envelope_count {
                flags |= FLAG_END;
            }
        }

        let payload_len: usize = payload_blocks.iter().map(|b| b.as_slice().len()).sum();
        debug_assert_eq!(payload_len, take_len);

        let mut header_block = pool.acquire(HEADER_LEN)?;
        // The checksum needs the fully assembled payload bytes; for a fragmented
        // payload spanning several blocks that means hashing them in order before the
        // header can be finalized, so we build the header against a flattened copy.
        let flat_payload: Vec<u8> = payload_blocks.iter().flat_map(|b| b.as_slice().iter().copied()).collect();
        let header_bytes = Header::encode(message_type, flags, session_id, &flat_payload);
        header_block.put_slice(&header_bytes);
        header_block.freeze();
        out.push(header_block);
        for block in payload_blocks {
            out.push(block);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Header;

    fn chain_of(pool: &BlockPool, data: &[u8], block_size: usize) -> BlockChain {
        let mut chain = BlockChain::new();
        for chunk in data.chunks(block_size) {
            let mut block = pool.acquire(block_size).unwrap();
            block.put_slice(chunk);
            chain.push(block);
        }
        chain
    }

    #[test]
    fn short_message_emits_single_envelope() {
        let pool = BlockPool::new(64);
        let body = chain_of(&pool, b"hello", 16);
        let out = encode_message(&pool, 1, 9, body).unwrap();
        let blocks: Vec<_> = out.iter().collect();
        assert_eq!(blocks.len(), 2); // header + one payload block
        let header = Header::decode(blocks[0].as_slice().try_into().unwrap()).unwrap();
        assert_eq!(header.flags, 0);
        assert_eq!(header.payload_len, 5);
    }

    #[test]
    fn oversize_message_fragments_with_end_flag_on_last() {
        let pool = BlockPool::new(64);
        let p = crate::envelope::MAX_PAYLOAD;
        let total = 2 * p + 37;
        let body = chain_of(&pool, &vec![0xAB; total], 8192);
        let out = encode_message(&pool, 2, 5, body).unwrap();

        let mut headers = Vec::new();
        let blocks: Vec<_> = out.iter().collect();
        let mut i = 0;
        while i < blocks.len() {
            let header = Header::decode(blocks[i].as_slice().try_into().unwrap()).unwrap();
            let mut remaining = header.payload_len as usize;
            i += 1;
            while remaining > 0 {
                remaining -= blocks[i].as_slice().len();
                i += 1;
            }
            headers.push(header);
        }

        assert_eq!(headers.len(), 3);
        assert!(headers[0].is_fragment() && !headers[0].is_end());
        assert!(headers[1].is_fragment() && !headers[1].is_end());
        assert!(headers[2].is_fragment() && headers[2].is_end());
    }
}
