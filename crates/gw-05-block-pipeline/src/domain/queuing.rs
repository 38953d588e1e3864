//! Ordered, throttled block delivery to the blockchain node.
//!
//! Blocks leave in arrival order. A block still waiting on recovery holds
//! its slot with a placeholder so recovered blocks do not jump the line.
//! Deliveries are spaced by the minimum inter-block interval unless the node
//! already confirmed the previous block, and a node that reports `NotReady`
//! pushes the next attempt out by the readiness-check interval.

use crate::domain::config::{MAX_INTERVAL_BETWEEN_BLOCKS_S, NODE_READINESS_FOR_BLOCKS_CHECK_INTERVAL_S};
use crate::ports::{GatewayContext, NodeSendResult};
use shared_types::{AlarmAction, Sha256Hash};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

struct QueuedBlock {
    block_hash: Sha256Hash,
    message: Option<Vec<u8>>,
    waiting_for_recovery: bool,
}

/// FIFO of blocks headed for the blockchain node.
#[derive(Default)]
pub struct BlockQueuingService {
    queue: VecDeque<QueuedBlock>,
    last_sent: Option<(Sha256Hash, std::time::Instant)>,
    last_sent_confirmed: bool,
}

impl BlockQueuingService {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued blocks (placeholders included).
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// True if `block_hash` occupies a slot.
    pub fn contains(&self, block_hash: &Sha256Hash) -> bool {
        self.queue.iter().any(|b| &b.block_hash == block_hash)
    }

    /// Enqueues a block (or a recovery placeholder) and tries to deliver.
    pub fn push(
        &mut self,
        block_hash: Sha256Hash,
        message: Option<Vec<u8>>,
        waiting_for_recovery: bool,
        ctx: &mut dyn GatewayContext,
    ) {
        if self.contains(&block_hash) {
            debug!(%block_hash, "block already queued");
            return;
        }
        self.queue.push_back(QueuedBlock {
            block_hash,
            message,
            waiting_for_recovery,
        });
        self.try_send(ctx);
    }

    /// Attaches a recovered block to its placeholder and tries to deliver.
    pub fn update_recovered_block(
        &mut self,
        block_hash: &Sha256Hash,
        message: Vec<u8>,
        ctx: &mut dyn GatewayContext,
    ) {
        match self.queue.iter_mut().find(|b| &b.block_hash == block_hash) {
            Some(entry) => {
                entry.message = Some(message);
                entry.waiting_for_recovery = false;
                self.try_send(ctx);
            }
            None => debug!(%block_hash, "no queued placeholder for recovered block"),
        }
    }

    /// Removes blocks the node already has via its native p2p path.
    pub fn mark_blocks_seen_by_blockchain_node(
        &mut self,
        block_hashes: &[Sha256Hash],
        ctx: &mut dyn GatewayContext,
    ) {
        if let Some((last_hash, _)) = &self.last_sent {
            if block_hashes.contains(last_hash) {
                self.last_sent_confirmed = true;
            }
        }
        let before = self.queue.len();
        self.queue
            .retain(|b| !block_hashes.contains(&b.block_hash));
        if self.queue.len() != before {
            debug!(
                removed = before - self.queue.len(),
                "dropped blocks already seen by node"
            );
        }
        self.try_send(ctx);
    }

    /// Drops a block unconditionally (recovery exhausted, conversion
    /// failure). Returns true if it was queued.
    pub fn remove(&mut self, block_hash: &Sha256Hash) -> bool {
        let before = self.queue.len();
        self.queue.retain(|b| &b.block_hash != block_hash);
        self.queue.len() != before
    }

    /// Alarm entry point for the spacing and readiness re-checks.
    pub fn on_release_alarm(&mut self, ctx: &mut dyn GatewayContext) {
        self.try_send(ctx);
    }

    fn try_send(&mut self, ctx: &mut dyn GatewayContext) {
        loop {
            let Some(head) = self.queue.front() else {
                return;
            };
            if head.waiting_for_recovery || head.message.is_none() {
                return;
            }

            // Respect the inter-block spacing unless the node confirmed the
            // previous delivery through its own chain.
            if let Some((_, sent_at)) = self.last_sent {
                if !self.last_sent_confirmed {
                    let spacing = Duration::from_secs_f64(MAX_INTERVAL_BETWEEN_BLOCKS_S);
                    let elapsed = ctx.now().duration_since(sent_at);
                    if elapsed < spacing {
                        ctx.schedule(spacing - elapsed, AlarmAction::ReleaseNextBlock);
                        return;
                    }
                }
            }

            let head = self.queue.front_mut().expect("head checked above");
            let message = head.message.clone().expect("message checked above");
            let block_hash = head.block_hash;
            match ctx.send_to_blockchain_node(message) {
                NodeSendResult::Sent => {
                    info!(%block_hash, "block sent to blockchain node");
                    self.queue.pop_front();
                    self.last_sent = Some((block_hash, ctx.now()));
                    self.last_sent_confirmed = false;
                }
                NodeSendResult::NotReady => {
                    warn!(%block_hash, "blockchain node not ready for block, deferring");
                    ctx.schedule(
                        Duration::from_secs(NODE_READINESS_FOR_BLOCKS_CHECK_INTERVAL_S),
                        AlarmAction::NodeReadinessCheck,
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedContext;

    fn hash(byte: u8) -> Sha256Hash {
        Sha256Hash::new([byte; 32])
    }

    #[test]
    fn test_push_sends_immediately() {
        let mut ctx = ScriptedContext::new();
        let mut queue = BlockQueuingService::new();
        queue.push(hash(1), Some(vec![1, 1]), false, &mut ctx);
        assert_eq!(ctx.node_sends(), vec![&vec![1, 1]]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_spacing_between_blocks() {
        let mut ctx = ScriptedContext::new();
        let mut queue = BlockQueuingService::new();
        queue.push(hash(1), Some(vec![1]), false, &mut ctx);
        queue.push(hash(2), Some(vec![2]), false, &mut ctx);

        // Second block deferred until the spacing alarm fires.
        assert_eq!(ctx.node_sends().len(), 1);
        let due = ctx.advance(Duration::from_millis(200));
        assert!(due.contains(&AlarmAction::ReleaseNextBlock));
        queue.on_release_alarm(&mut ctx);
        assert_eq!(ctx.node_sends().len(), 2);
    }

    #[test]
    fn test_confirmed_block_lifts_spacing() {
        let mut ctx = ScriptedContext::new();
        let mut queue = BlockQueuingService::new();
        queue.push(hash(1), Some(vec![1]), false, &mut ctx);
        // Node announces it has block 1; block 2 goes straight out.
        queue.mark_blocks_seen_by_blockchain_node(&[hash(1)], &mut ctx);
        queue.push(hash(2), Some(vec![2]), false, &mut ctx);
        assert_eq!(ctx.node_sends().len(), 2);
    }

    #[test]
    fn test_placeholder_preserves_order() {
        let mut ctx = ScriptedContext::new();
        let mut queue = BlockQueuingService::new();
        queue.push(hash(1), None, true, &mut ctx);
        queue.push(hash(2), Some(vec![2]), false, &mut ctx);

        // Nothing sent while the head waits on recovery.
        assert!(ctx.node_sends().is_empty());
        assert_eq!(queue.len(), 2);

        queue.update_recovered_block(&hash(1), vec![1], &mut ctx);
        assert_eq!(ctx.node_sends().first(), Some(&&vec![1u8]));
    }

    #[test]
    fn test_not_ready_defers_and_retries() {
        let mut ctx = ScriptedContext::new();
        ctx.node_ready = false;
        let mut queue = BlockQueuingService::new();
        queue.push(hash(1), Some(vec![1]), false, &mut ctx);
        assert!(ctx.node_sends().is_empty());
        assert_eq!(queue.len(), 1);

        ctx.node_ready = true;
        let due = ctx.advance(Duration::from_secs(6));
        assert!(due.contains(&AlarmAction::NodeReadinessCheck));
        queue.on_release_alarm(&mut ctx);
        assert_eq!(ctx.node_sends().len(), 1);
    }

    #[test]
    fn test_remove_drops_placeholder() {
        let mut ctx = ScriptedContext::new();
        let mut queue = BlockQueuingService::new();
        queue.push(hash(1), None, true, &mut ctx);
        assert!(queue.remove(&hash(1)));
        assert!(!queue.remove(&hash(1)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_seen_blocks_removed_from_queue() {
        let mut ctx = ScriptedContext::new();
        let mut queue = BlockQueuingService::new();
        queue.push(hash(1), None, true, &mut ctx);
        queue.push(hash(2), Some(vec![2]), false, &mut ctx);
        queue.mark_blocks_seen_by_blockchain_node(&[hash(1)], &mut ctx);

        // Placeholder gone, block 2 can now deliver.
        assert_eq!(ctx.node_sends(), vec![&vec![2]]);
        assert!(queue.is_empty());
    }
}
