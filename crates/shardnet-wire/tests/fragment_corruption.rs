use shardnet_buffer::{Block, BlockChain, BlockPool};
use shardnet_core::error::codes;
use shardnet_wire::{encode_message, Accumulator, HEADER_LEN, MAX_PAYLOAD};

fn flatten(chain: &BlockChain) -> Vec<u8> {
    chain.iter().flat_map(|b| b.as_slice().iter().copied()).collect()
}

/// A message sized to fragment into exactly four envelopes.
fn four_envelope_payload() -> Vec<u8> {
    vec![0x3Cu8; 3 * MAX_PAYLOAD + 17]
}

fn encode(pool: &BlockPool, payload: &[u8]) -> Vec<u8> {
    let mut body = BlockChain::new();
    let mut block: Block = pool.acquire(payload.len()).unwrap();
    block.put_slice(payload);
    body.push(block);
    flatten(&encode_message(pool, 5, 77, body).unwrap())
}

/// Wraps raw wire bytes as a one-block chain, the shape `Accumulator::feed` takes.
fn chain_of(pool: &BlockPool, bytes: &[u8]) -> BlockChain {
    let mut block = pool.acquire(bytes.len().max(1)).unwrap();
    block.put_slice(bytes);
    block.freeze();
    let mut chain = BlockChain::new();
    chain.push(block);
    chain
}

#[test]
fn four_envelope_message_fragments_as_expected() {
    let pool = BlockPool::new(64);
    let payload = four_envelope_payload();
    let bytes = encode(&pool, &payload);
    // header + payload per envelope, four envelopes total, no shared headers.
    let expected_total: usize = (0..4)
        .map(|i| HEADER_LEN + envelope_payload_len(payload.len(), i))
        .sum();
    assert_eq!(bytes.len(), expected_total);

    let mut acc = Accumulator::new(pool.clone());
    let messages = acc.feed(&chain_of(&pool, &bytes)).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(flatten(&messages[0].chain), payload);
}

fn envelope_payload_len(total: usize, index: usize) -> usize {
    let full = MAX_PAYLOAD;
    let remaining = total - index * full;
    remaining.min(full)
}

/// Corrupting the checksum of the second of four envelopes must abort the whole
/// message: the accumulator rejects it before ever reaching the fourth envelope's
/// `FLAG_END`, and the partially assembled chain is discarded rather than handed to
/// the sink.
#[test]
fn corrupting_second_of_four_envelopes_discards_the_message() {
    let pool = BlockPool::new(64);
    let payload = four_envelope_payload();
    let mut bytes = encode(&pool, &payload);

    let first_len = HEADER_LEN + envelope_payload_len(payload.len(), 0);
    let second_len = HEADER_LEN + envelope_payload_len(payload.len(), 1);
    // Flip a bit inside the second envelope's payload; its checksum no longer matches.
    let corrupt_at = first_len + HEADER_LEN + 3;
    bytes[corrupt_at] ^= 0xFF;

    let mut acc = Accumulator::new(pool.clone());
    // The first envelope feeds through fine (no output yet, mid-fragment).
    let first_result = acc.feed(&chain_of(&pool, &bytes[..first_len]));
    assert!(first_result.unwrap().is_empty());

    let second_result = acc.feed(&chain_of(&pool, &bytes[first_len..first_len + second_len]));
    let err = second_result.expect_err("corrupted envelope must be rejected");
    assert_eq!(err.code(), codes::WIRE_CHECKSUM_MISMATCH);

    // The first envelope's already-assembled fragment must not be left pinned in the
    // pool waiting on the caller to tear the accumulator down.
    drop(acc);
    assert_eq!(pool.statistics().referenced, 0);
}
