//! # End-to-End Pipeline Scenarios
//!
//! Drives the real services — relay protocol, block pipeline, transaction
//! service, recovery, queuing, neutrality — through a scripted context with a
//! manual clock, covering the gateway's full block and transaction flows:
//!
//! 1. **Transaction assignment**: contents first, short id later
//! 2. **Duplicate suppression**: replays only bump counters
//! 3. **Hold race won by the BDN**: the local copy never propagates
//! 4. **Hold timeout**: the local copy propagates after the deadline
//! 5. **Recovery**: unknown short ids are fetched, the block delivers late
//! 6. **Recovery exhaustion**: the retry schedule gives up cleanly

#[cfg(test)]
mod tests {
    use gw_01_tx_service::{TransactionService, TxServiceConfig};
    use gw_02_messages::{BxMessage, TxsEntry};
    use gw_03_btc_protocol::constants::BTC_MAINNET_MAGIC;
    use gw_03_btc_protocol::messages::build_block_message;
    use gw_03_btc_protocol::tx::{parse_transaction, test_support::legacy_tx};
    use gw_03_btc_protocol::BtcBlockConverter;
    use gw_05_block_pipeline::testing::ScriptedContext;
    use gw_05_block_pipeline::{BlockPipeline, PipelineConfig};
    use gw_06_connections::{ConnectionInfo, RelayConnectionProtocol};
    use shared_types::{
        double_sha256, AlarmAction, ConnectionId, ConnectionRole, Sha256Hash, NULL_SHORT_ID,
    };
    use std::time::Duration;

    const NODE_ID: [u8; 16] = [7; 16];

    struct Harness {
        ctx: ScriptedContext,
        pipeline: BlockPipeline,
        relay: RelayConnectionProtocol,
    }

    impl Harness {
        fn new() -> Self {
            let mut ctx = ScriptedContext::new();
            let pipeline = BlockPipeline::new(
                PipelineConfig::default(),
                Box::new(BtcBlockConverter::new(BTC_MAINNET_MAGIC)),
                TxServiceConfig::default(),
            );
            let relay = RelayConnectionProtocol::new(
                ConnectionInfo::new(ConnectionId(1), ConnectionRole::RELAY_ALL, "relay"),
                1,
                NODE_ID,
                &mut ctx,
            );
            Self {
                ctx,
                pipeline,
                relay,
            }
        }

        fn deliver(&mut self, msg: &BxMessage) {
            self.relay.on_message(
                msg.msg_type(),
                &msg.encode_payload(),
                &mut self.pipeline,
                &mut self.ctx,
            );
        }

        /// Advances the clock and executes every due alarm the way the event
        /// loop would.
        fn advance(&mut self, delta: Duration) {
            for action in self.ctx.advance(delta) {
                match action {
                    AlarmAction::SendPing(_)
                    | AlarmAction::HandshakeTimeout(_)
                    | AlarmAction::DiscoveryPongTimeout(_)
                    | AlarmAction::RequestBlockConfirmation(_)
                    | AlarmAction::StopWaitingCheckpointHeaders(_) => {}
                    other => self.pipeline.on_alarm(other, &mut self.ctx),
                }
            }
        }

        fn encrypted_broadcasts(&self) -> usize {
            self.ctx
                .broadcasts()
                .iter()
                .filter(|m| matches!(m, BxMessage::Broadcast { .. }))
                .count()
        }
    }

    fn tx_message(tx: &[u8], short_id: u32, with_contents: bool) -> (Sha256Hash, BxMessage) {
        let tx_hash = parse_transaction(tx, 0).unwrap().txid;
        let msg = BxMessage::Tx {
            tx_hash,
            network_num: 1,
            short_id,
            contents: if with_contents { tx.to_vec() } else { Vec::new() },
        };
        (tx_hash, msg)
    }

    /// Compresses a block against a sender-side cache so the harness can
    /// receive a bx-block referencing short ids it has never seen.
    fn foreign_bx_block(txns: &[Vec<u8>], first_sid: u32, header_tag: u8) -> (Sha256Hash, Vec<u8>, Vec<u8>) {
        let block_msg = build_block_message(BTC_MAINNET_MAGIC, &[header_tag; 80], txns);
        let mut sender = TransactionService::with_defaults();
        for (i, tx) in txns.iter().enumerate() {
            let txid = parse_transaction(tx, 0).unwrap().txid;
            sender.assign_short_id(txid, first_sid + i as u32).unwrap();
            sender.set_transaction_contents(txid, tx.clone());
        }
        let (bx_block, info) =
            gw_02_messages::BlockConverter::block_to_bx_block(
                &BtcBlockConverter::new(BTC_MAINNET_MAGIC),
                &block_msg,
                &sender,
            )
            .unwrap();
        (info.block_hash, bx_block, block_msg)
    }

    #[test]
    fn test_s1_transaction_assignment() {
        let mut harness = Harness::new();
        let tx = legacy_tx(1);

        // Contents arrive without a short id, then the sid arrives alone.
        let (tx_hash, first) = tx_message(&tx, NULL_SHORT_ID, true);
        harness.deliver(&first);
        let (_, second) = tx_message(&tx, 5, false);
        harness.deliver(&second);

        assert_eq!(harness.pipeline.tx_service.get_short_id(&tx_hash), 5);
        assert_eq!(
            harness.pipeline.tx_service.get_transaction_by_hash(&tx_hash),
            Some(&tx[..])
        );
        // Forwarded to the node exactly once, by the first message.
        assert_eq!(harness.ctx.node_sends().len(), 1);
    }

    #[test]
    fn test_s2_duplicate_transaction_ignored() {
        let mut harness = Harness::new();
        let tx = legacy_tx(2);

        let (_, with_sid) = tx_message(&tx, 5, true);
        harness.deliver(&with_sid);
        let (_, replay) = tx_message(&tx, NULL_SHORT_ID, true);
        harness.deliver(&replay);

        assert_eq!(
            harness.pipeline.stats.snapshot().tx_duplicate_from_relay,
            1
        );
        assert_eq!(harness.ctx.node_sends().len(), 1);
    }

    #[test]
    fn test_s3_block_hold_wins_race() {
        let mut harness = Harness::new();
        let (block_hash, bx_block, block_msg) = foreign_bx_block(&[], 0, 0x31);

        // Peer claims it will propagate the block.
        harness.deliver(&BxMessage::BlockHolding {
            block_hash,
            network_num: 1,
        });
        // The blockchain node hands us the same block: held, not compressed.
        harness.pipeline.queue_block_for_processing(
            block_hash,
            block_msg.clone(),
            ConnectionId(9),
            &mut harness.ctx,
        );
        assert_eq!(harness.encrypted_broadcasts(), 0);
        assert_eq!(harness.pipeline.active_holds(), 1);

        // Before the timeout the block arrives via the BDN (plaintext form).
        harness.deliver(&BxMessage::Broadcast {
            block_hash: double_sha256(&bx_block),
            network_num: 1,
            is_encrypted: false,
            blob: bx_block,
        });

        // Hold cancelled, block delivered to the node, local copy dropped.
        assert_eq!(harness.pipeline.active_holds(), 0);
        assert_eq!(harness.ctx.node_sends(), vec![&block_msg]);
        harness.advance(Duration::from_secs(10));
        assert_eq!(harness.encrypted_broadcasts(), 0);
    }

    #[test]
    fn test_s4_block_hold_times_out() {
        let mut harness = Harness::new();
        let (block_hash, _, block_msg) = foreign_bx_block(&[], 0, 0x32);

        harness.deliver(&BxMessage::BlockHolding {
            block_hash,
            network_num: 1,
        });
        harness.pipeline.queue_block_for_processing(
            block_hash,
            block_msg,
            ConnectionId(9),
            &mut harness.ctx,
        );
        assert_eq!(harness.encrypted_broadcasts(), 0);

        // No BDN delivery: the hold expires and the local copy propagates.
        harness.advance(Duration::from_secs(1));
        assert_eq!(harness.encrypted_broadcasts(), 1);
        assert_eq!(harness.pipeline.active_holds(), 0);
    }

    #[test]
    fn test_s5_decompression_with_unknown_sid() {
        let mut harness = Harness::new();
        let tx = legacy_tx(5);
        let tx_hash = parse_transaction(&tx, 0).unwrap().txid;
        let (block_hash, bx_block, block_msg) = foreign_bx_block(&[tx.clone()], 99, 0x33);

        harness.deliver(&BxMessage::Broadcast {
            block_hash: double_sha256(&bx_block),
            network_num: 1,
            is_encrypted: false,
            blob: bx_block,
        });

        // Placeholder queued; GetTxs([99]) went to relay-tx peers.
        assert!(harness.pipeline.queuing.contains(&block_hash));
        assert!(harness.pipeline.recovery.is_in_recovery(&block_hash));
        assert!(harness.ctx.broadcasts().iter().any(|m| matches!(
            m,
            BxMessage::GetTxs { short_ids } if short_ids == &vec![99]
        )));
        assert!(harness.ctx.node_sends().is_empty());

        // The relay answers with the missing transaction.
        harness.deliver(&BxMessage::Txs {
            txs: vec![TxsEntry {
                short_id: 99,
                tx_hash,
                contents: tx,
            }],
        });

        assert!(!harness.pipeline.recovery.is_in_recovery(&block_hash));
        assert!(!harness.pipeline.queuing.contains(&block_hash));
        assert_eq!(harness.ctx.node_sends(), vec![&block_msg]);
    }

    #[test]
    fn test_s6_recovery_exhaustion() {
        let mut harness = Harness::new();
        let tx = legacy_tx(6);
        let (block_hash, bx_block, _) = foreign_bx_block(&[tx], 42, 0x34);

        harness.deliver(&BxMessage::Broadcast {
            block_hash: double_sha256(&bx_block),
            network_num: 1,
            is_encrypted: false,
            blob: bx_block,
        });
        assert!(harness.pipeline.recovery.is_in_recovery(&block_hash));
        let initial_requests = harness
            .ctx
            .broadcasts()
            .iter()
            .filter(|m| matches!(m, BxMessage::GetTxs { .. }))
            .count();

        // The relay never responds; walk through the whole retry schedule.
        for _ in 0..8 {
            harness.advance(Duration::from_secs(3));
        }

        assert!(!harness.pipeline.recovery.is_in_recovery(&block_hash));
        assert!(!harness.pipeline.queuing.contains(&block_hash));
        assert!(harness.ctx.node_sends().is_empty());
        // Requests were re-broadcast on the retry schedule before giving up.
        let total_requests = harness
            .ctx
            .broadcasts()
            .iter()
            .filter(|m| matches!(m, BxMessage::GetTxs { .. }))
            .count();
        assert!(total_requests > initial_requests);
        assert_eq!(
            harness.pipeline.stats.snapshot().blocks_recovery_exhausted,
            1
        );
    }

    #[test]
    fn test_encrypted_block_and_key_flow() {
        // The full encrypted path: ciphertext arrives first, a receipt goes
        // to gateway peers, the key completes the pair.
        let mut harness = Harness::new();
        let (_, bx_block, block_msg) = foreign_bx_block(&[], 0, 0x35);
        let (ciphertext, key) = gw_05_block_pipeline::in_progress::encrypt_block(&bx_block);
        let ciphertext_hash = double_sha256(&ciphertext);

        harness.deliver(&BxMessage::Broadcast {
            block_hash: ciphertext_hash,
            network_num: 1,
            is_encrypted: true,
            blob: ciphertext,
        });
        assert!(harness
            .ctx
            .broadcasts()
            .iter()
            .any(|m| matches!(m, BxMessage::BlockReceived { .. })));
        assert!(harness.ctx.node_sends().is_empty());

        harness.deliver(&BxMessage::Key {
            block_hash: ciphertext_hash,
            network_num: 1,
            key,
        });
        assert_eq!(harness.ctx.node_sends(), vec![&block_msg]);
    }

    #[test]
    fn test_duplicate_bdn_block_is_suppressed() {
        let mut harness = Harness::new();
        let (_, bx_block, block_msg) = foreign_bx_block(&[], 0, 0x36);

        for _ in 0..2 {
            harness.deliver(&BxMessage::Broadcast {
                block_hash: double_sha256(&bx_block),
                network_num: 1,
                is_encrypted: false,
                blob: bx_block.clone(),
            });
        }

        assert_eq!(harness.ctx.node_sends(), vec![&block_msg]);
        assert_eq!(harness.pipeline.stats.snapshot().blocks_duplicate, 1);
    }
}
