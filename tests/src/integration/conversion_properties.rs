//! # Compression Invariants
//!
//! Randomized cross-crate checks of the properties the pipeline depends on:
//!
//! 1. Round-trip without recovery is byte-exact
//! 2. Round-trip completes after recovery fills the cache
//! 3. The short id map stays injective under arbitrary assignment
//! 4. Hold cancellation is idempotent and never propagates the held copy
//! 5. Recovery unknown sets shrink monotonically until empty
//! 6. Compact-block short ids follow the siphash definition

#[cfg(test)]
mod tests {
    use gw_01_tx_service::{TransactionService, TxServiceConfig};
    use gw_02_messages::BlockConverter;
    use gw_03_btc_protocol::compact::{compute_short_id, short_id_key};
    use gw_03_btc_protocol::constants::BTC_MAINNET_MAGIC;
    use gw_03_btc_protocol::messages::build_block_message;
    use gw_03_btc_protocol::tx::{
        parse_transaction,
        test_support::{legacy_tx, segwit_tx},
    };
    use gw_03_btc_protocol::BtcBlockConverter;
    use gw_04_eth_protocol::block::{build_header, InternalEthBlock};
    use gw_04_eth_protocol::EthBlockConverter;
    use gw_05_block_pipeline::testing::ScriptedContext;
    use gw_05_block_pipeline::{BlockPipeline, BlockRecoveryService, PipelineConfig};
    use rand::{Rng, SeedableRng};
    use shared_types::{ConnectionId, Sha256Hash, ShortId};
    use std::time::Instant;

    fn btc_converter() -> BtcBlockConverter {
        BtcBlockConverter::new(BTC_MAINNET_MAGIC)
    }

    fn random_btc_txns(rng: &mut impl Rng, count: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|_| {
                if rng.gen_bool(0.3) {
                    segwit_tx(rng.gen())
                } else {
                    legacy_tx(rng.gen())
                }
            })
            .collect()
    }

    #[test]
    fn test_btc_round_trip_with_random_known_subsets() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let converter = btc_converter();

        for case in 0..25 {
            let txn_count = rng.gen_range(0..12);
            let txns = random_btc_txns(&mut rng, txn_count);
            let block = build_block_message(BTC_MAINNET_MAGIC, &[case as u8; 80], &txns);

            // A random subset of transactions is known by short id.
            let mut service = TransactionService::with_defaults();
            for (i, tx) in txns.iter().enumerate() {
                if rng.gen_bool(0.5) {
                    let txid = parse_transaction(tx, 0).unwrap().txid;
                    service.assign_short_id(txid, (i + 1) as ShortId).unwrap();
                    service.set_transaction_contents(txid, tx.clone());
                }
            }

            let (bx_block, info) = converter.block_to_bx_block(&block, &service).unwrap();
            let result = converter.bx_block_to_block(&bx_block, &service).unwrap();
            assert_eq!(
                result.block.as_deref(),
                Some(&block[..]),
                "case {case}: round trip must be byte-exact"
            );
            assert_eq!(result.block_info.short_ids, info.short_ids);
        }
    }

    #[test]
    fn test_btc_round_trip_after_recovery() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(13);
        let converter = btc_converter();

        for case in 0..10 {
            let txn_count = rng.gen_range(1..8);
            let txns = random_btc_txns(&mut rng, txn_count);
            let block = build_block_message(BTC_MAINNET_MAGIC, &[0x80 + case as u8; 80], &txns);

            let mut sender = TransactionService::with_defaults();
            for (i, tx) in txns.iter().enumerate() {
                let txid = parse_transaction(tx, 0).unwrap().txid;
                sender.assign_short_id(txid, (i + 1) as ShortId).unwrap();
                sender.set_transaction_contents(txid, tx.clone());
            }
            let (bx_block, _) = converter.block_to_bx_block(&block, &sender).unwrap();

            // The receiver starts empty and reports unknowns.
            let mut receiver = TransactionService::with_defaults();
            let first = converter.bx_block_to_block(&bx_block, &receiver).unwrap();
            assert!(first.needs_recovery());

            // Learning every reported sid allows an exact re-decompression.
            for sid in &first.unknown_sids {
                let index = (*sid - 1) as usize;
                let txid = parse_transaction(&txns[index], 0).unwrap().txid;
                receiver.assign_short_id(txid, *sid).unwrap();
                receiver.set_transaction_contents(txid, txns[index].clone());
            }
            let second = converter.bx_block_to_block(&bx_block, &receiver).unwrap();
            assert_eq!(second.block.as_deref(), Some(&block[..]));
        }
    }

    #[test]
    fn test_eth_round_trip_with_random_known_subsets() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(17);
        let converter = EthBlockConverter;

        for case in 0..25 {
            let txns: Vec<Vec<u8>> = (0..rng.gen_range(0..10))
                .map(|_| {
                    let len = rng.gen_range(1..200);
                    let body: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    rlp::encode(&body).to_vec()
                })
                .collect();
            let block = InternalEthBlock {
                header: build_header(&Sha256Hash::new([case as u8; 32]), 100, case as u64),
                transactions: txns.clone(),
                uncles: rlp::RlpStream::new_list(0).out().to_vec(),
                total_difficulty: rng.gen(),
            };
            let payload = block.encode_payload();

            let mut service = TransactionService::with_defaults();
            for (i, tx) in txns.iter().enumerate() {
                if rng.gen_bool(0.5) {
                    let txid = Sha256Hash::new(
                        gw_04_eth_protocol::crypto_utils::keccak256(tx),
                    );
                    service.assign_short_id(txid, (i + 1) as ShortId).unwrap();
                    service.set_transaction_contents(txid, tx.clone());
                }
            }

            let (bx_block, _) = converter.block_to_bx_block(&payload, &service).unwrap();
            let result = converter.bx_block_to_block(&bx_block, &service).unwrap();
            assert_eq!(result.block.as_deref(), Some(&payload[..]));
        }
    }

    #[test]
    fn test_short_id_map_injective_under_random_assignment() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(19);
        let mut service = TransactionService::new(TxServiceConfig {
            entry_budget: usize::MAX,
            byte_budget: usize::MAX,
            seen_blocks_window: 6,
        });
        let mut assigned: Vec<(Sha256Hash, ShortId)> = Vec::new();

        for _ in 0..10_000 {
            let hash = Sha256Hash::new([rng.gen_range(0..64u8); 32]);
            let sid: ShortId = rng.gen_range(1..256);
            let _ = service.assign_short_id(hash, sid);
            assigned.push((hash, sid));
        }

        // Injectivity: each assigned sid resolves to exactly one hash, and
        // that hash's entry lists the sid.
        let mut seen_sids = std::collections::HashSet::new();
        for (_, sid) in &assigned {
            if !seen_sids.insert(*sid) {
                continue;
            }
            let (hash, _) = service.get_transaction(*sid).expect("assigned sid resolves");
            assert!(service.short_ids_for(&hash).contains(sid));
        }
    }

    #[test]
    fn test_hold_cancellation_idempotent() {
        let mut ctx = ScriptedContext::new();
        let mut pipeline = BlockPipeline::new(
            PipelineConfig::default(),
            Box::new(btc_converter()),
            TxServiceConfig::default(),
        );
        let block = build_block_message(BTC_MAINNET_MAGIC, &[0x77; 80], &[]);
        let block_hash = shared_types::double_sha256(&[0x77; 80]);

        for round in 0..5 {
            pipeline.place_hold(block_hash, ConnectionId(round), &mut ctx);
        }
        pipeline.queue_block_for_processing(block_hash, block, ConnectionId(9), &mut ctx);
        for _ in 0..3 {
            pipeline.cancel_hold_timeout(&block_hash, &mut ctx);
        }

        assert_eq!(pipeline.active_holds(), 0);
        // The cancelled alarm never fires, so the held copy never leaves.
        ctx.advance(std::time::Duration::from_secs(30));
        pipeline.on_alarm(shared_types::AlarmAction::HoldTimeout(block_hash), &mut ctx);
        assert_eq!(
            ctx.broadcasts()
                .iter()
                .filter(|m| matches!(m, gw_02_messages::BxMessage::Broadcast { .. }))
                .count(),
            0
        );
    }

    #[test]
    fn test_recovery_unknowns_shrink_monotonically() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(23);
        let mut recovery = BlockRecoveryService::new();
        let mut tx_service = TransactionService::with_defaults();
        let block_hash = Sha256Hash::new([0x52; 32]);

        let sids: Vec<ShortId> = (1..=20).collect();
        let hashes: Vec<Sha256Hash> = (0..5).map(|i| Sha256Hash::new([i as u8; 32])).collect();
        recovery.add_block(
            vec![0xAA; 8],
            block_hash,
            sids.clone(),
            hashes.clone(),
            Instant::now(),
            &mut tx_service,
        );

        let mut remaining = sids.len() + hashes.len();
        let mut work: Vec<(bool, usize)> = sids
            .iter()
            .map(|sid| (true, *sid as usize))
            .chain(hashes.iter().enumerate().map(|(i, _)| (false, i)))
            .collect();
        // Resolve in random order; the union must shrink by one each step.
        while !work.is_empty() {
            let pick = rng.gen_range(0..work.len());
            let (is_sid, value) = work.swap_remove(pick);
            if is_sid {
                assert!(recovery.check_missing_sid(value as ShortId));
            } else {
                assert!(recovery.check_missing_tx_hash(&hashes[value]));
            }
            remaining -= 1;

            let open = recovery.get_blocks_awaiting_recovery();
            let current = open
                .first()
                .map(|b| b.unknown_short_ids.len() + b.unknown_transaction_hashes.len())
                .unwrap_or(0);
            assert_eq!(current, remaining);
        }
        assert!(!recovery.is_in_recovery(&block_hash));
        assert_eq!(recovery.recovered_blocks().len(), 1);
    }

    #[test]
    fn test_compact_block_siphash_definition() {
        // The short id must equal the low six little-endian bytes of
        // SipHash-2-4 keyed with sha256(header ‖ nonce)[0..16] over the
        // byte-reversed transaction hash.
        use siphash_reference::siphash24_reference;

        let header = [0x13u8; 80];
        let nonce = 0x1122_3344_5566_7788u64;
        let key = short_id_key(&header, nonce);

        let mut rng = rand::rngs::StdRng::seed_from_u64(29);
        for _ in 0..100 {
            let mut hash_bytes = [0u8; 32];
            rng.fill(&mut hash_bytes);
            let tx_hash = Sha256Hash::new(hash_bytes);

            let expected = {
                let full = siphash24_reference(&key, &tx_hash.reversed());
                full.to_le_bytes()[..6].to_vec()
            };
            assert_eq!(compute_short_id(&key, &tx_hash).to_vec(), expected);
        }
    }

    /// Reference SipHash-2-4 implementation, written directly from the
    /// definition to cross-check the `siphasher`-based production path.
    mod siphash_reference {
        pub fn siphash24_reference(key: &[u8; 16], message: &[u8]) -> u64 {
            let k0 = u64::from_le_bytes(key[..8].try_into().unwrap());
            let k1 = u64::from_le_bytes(key[8..].try_into().unwrap());
            let mut v0 = 0x736f6d6570736575u64 ^ k0;
            let mut v1 = 0x646f72616e646f6du64 ^ k1;
            let mut v2 = 0x6c7967656e657261u64 ^ k0;
            let mut v3 = 0x7465646279746573u64 ^ k1;

            let mut round = |v0: &mut u64, v1: &mut u64, v2: &mut u64, v3: &mut u64| {
                *v0 = v0.wrapping_add(*v1);
                *v1 = v1.rotate_left(13);
                *v1 ^= *v0;
                *v0 = v0.rotate_left(32);
                *v2 = v2.wrapping_add(*v3);
                *v3 = v3.rotate_left(16);
                *v3 ^= *v2;
                *v0 = v0.wrapping_add(*v3);
                *v3 = v3.rotate_left(21);
                *v3 ^= *v0;
                *v2 = v2.wrapping_add(*v1);
                *v1 = v1.rotate_left(17);
                *v1 ^= *v2;
                *v2 = v2.rotate_left(32);
            };

            let mut chunks = message.chunks_exact(8);
            for chunk in &mut chunks {
                let m = u64::from_le_bytes(chunk.try_into().unwrap());
                v3 ^= m;
                round(&mut v0, &mut v1, &mut v2, &mut v3);
                round(&mut v0, &mut v1, &mut v2, &mut v3);
                v0 ^= m;
            }

            let rest = chunks.remainder();
            let mut last = [0u8; 8];
            last[..rest.len()].copy_from_slice(rest);
            last[7] = message.len() as u8;
            let m = u64::from_le_bytes(last);
            v3 ^= m;
            round(&mut v0, &mut v1, &mut v2, &mut v3);
            round(&mut v0, &mut v1, &mut v2, &mut v3);
            v0 ^= m;

            v2 ^= 0xFF;
            for _ in 0..4 {
                round(&mut v0, &mut v1, &mut v2, &mut v3);
            }
            v0 ^ v1 ^ v2 ^ v3
        }

        #[test]
        fn test_reference_against_paper_vector() {
            // Test vector from the SipHash paper: key 00..0f, message 00..0e.
            let key: [u8; 16] = (0..16u8).collect::<Vec<_>>().try_into().unwrap();
            let message: Vec<u8> = (0..15u8).collect();
            assert_eq!(siphash24_reference(&key, &message), 0xa129ca6149be45e5);
        }
    }
}
