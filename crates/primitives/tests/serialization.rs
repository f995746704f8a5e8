use trunkd_consensus::Hash256;
use trunkd_primitives::encoding;
use trunkd_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};

fn seq_hash(start: u8) -> Hash256 {
    std::array::from_fn(|i| start.wrapping_add(i as u8))
}

#[test]
fn block_header_byte_layout() {
    let header = BlockHeader {
        version: 2,
        prev_block: seq_hash(0x00),
        merkle_root: seq_hash(0x20),
        time: 0x0102_0304,
        bits: 0x0a0b_0c0d,
        nonce: 0x1122_3344,
    };
    let encoded = encoding::encode(&header);

    let mut expected = Vec::new();
    expected.extend_from_slice(&2i32.to_le_bytes());
    expected.extend_from_slice(&seq_hash(0x00));
    expected.extend_from_slice(&seq_hash(0x20));
    expected.extend_from_slice(&0x0102_0304u32.to_le_bytes());
    expected.extend_from_slice(&0x0a0b_0c0du32.to_le_bytes());
    expected.extend_from_slice(&0x1122_3344u32.to_le_bytes());
    assert_eq!(encoded, expected);
    assert_eq!(encoded.len(), 80);
}

#[test]
fn coinbase_transaction_layout() {
    let tx = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![0x01, 0x07],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 5_000_000_000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    };
    let encoded = encoding::encode(&tx);

    let mut expected = Vec::new();
    expected.extend_from_slice(&1i32.to_le_bytes());
    expected.push(1); // input count
    expected.extend_from_slice(&[0u8; 32]); // null prevout hash
    expected.extend_from_slice(&u32::MAX.to_le_bytes()); // null prevout index
    expected.extend_from_slice(&[0x02, 0x01, 0x07]); // script length + script
    expected.extend_from_slice(&u32::MAX.to_le_bytes()); // sequence
    expected.push(1); // output count
    expected.extend_from_slice(&5_000_000_000i64.to_le_bytes());
    expected.extend_from_slice(&[0x01, 0x51]);
    expected.extend_from_slice(&0u32.to_le_bytes()); // lock time
    assert_eq!(encoded, expected);

    let decoded: Transaction = encoding::decode(&encoded).expect("decode");
    assert!(decoded.is_coinbase());
    assert_eq!(decoded.txid(), tx.txid());
}

#[test]
fn block_round_trip_with_multiple_transactions() {
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![0x01, 0x01],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 5_000_000_000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    };
    let payment = Transaction {
        version: 1,
        inputs: vec![
            TxIn {
                prevout: OutPoint::new(seq_hash(0x40), 0),
                script_sig: vec![0x00; 70],
                sequence: u32::MAX,
            },
            TxIn {
                prevout: OutPoint::new(seq_hash(0x60), 3),
                script_sig: Vec::new(),
                sequence: 0,
            },
        ],
        outputs: vec![
            TxOut {
                value: 1,
                script_pubkey: vec![0x52],
            },
            TxOut {
                value: 4_999_999_999,
                script_pubkey: vec![0x76, 0xa9, 0x14],
            },
        ],
        lock_time: 1_700_000_000,
    };
    let block = Block {
        header: BlockHeader {
            version: 2,
            prev_block: seq_hash(0x80),
            merkle_root: seq_hash(0xa0),
            time: 1_300_000_000,
            bits: 0x1d00ffff,
            nonce: 7,
        },
        transactions: vec![coinbase, payment],
    };

    let encoded = encoding::encode(&block);
    let decoded: Block = encoding::decode(&encoded).expect("decode");
    assert_eq!(decoded, block);
    assert_eq!(decoded.hash(), block.hash());
    assert_eq!(block.serialized_size(), encoded.len());
}

#[test]
fn trailing_bytes_are_rejected() {
    let header = BlockHeader {
        version: 2,
        prev_block: seq_hash(0x00),
        merkle_root: seq_hash(0x20),
        time: 0,
        bits: 0,
        nonce: 0,
    };
    let mut encoded = encoding::encode(&header);
    encoded.push(0x00);
    assert!(encoding::decode::<BlockHeader>(&encoded).is_err());
}
