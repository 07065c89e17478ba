//! Header syncer -- walks the local chain up to the best known head.
//!
//! Requests windows of headers anchored at the last stored header. A window
//! that doesn't start with the anchor means the peer is on a different
//! branch: the same window is requested in reverse and sync resumes from
//! the newest header both chains share.

use std::sync::Arc;

use ethspv_protocol::{BlockHeader, H256};
use ethspv_storage::{ChainStorage, Storage};

use crate::validator::{validate_from_anchor, ChainError};
use crate::{SyncError, Task};

/// What the caller should do after feeding a batch in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStep {
    /// Submit this task to the engine.
    Request(Task),
    /// Caught up; the new local head.
    Synced(BlockHeader),
}

pub struct HeaderSyncer {
    storage: Arc<dyn Storage>,
    /// Trusted header to start from when storage is empty.
    checkpoint: BlockHeader,
    headers_limit: u64,
    syncing: bool,
}

impl HeaderSyncer {
    pub fn new(storage: Arc<dyn Storage>, checkpoint: BlockHeader, headers_limit: u64) -> Self {
        Self {
            storage,
            checkpoint,
            headers_limit,
            syncing: false,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    pub fn last_header(&self) -> Result<BlockHeader, SyncError> {
        Ok(self
            .storage
            .last_header()?
            .unwrap_or_else(|| self.checkpoint.clone()))
    }

    fn window(&self, from: BlockHeader, reverse: bool) -> Task {
        Task::header_range(from, self.headers_limit, reverse)
    }

    /// A peer reported its best block (handshake or announce). Returns the
    /// first task if this starts a sync.
    pub fn on_peer_head(&mut self, hash: H256, number: u64) -> Result<Option<Task>, SyncError> {
        if self.syncing {
            tracing::debug!(number, "sync: already syncing");
            return Ok(None);
        }
        let last = self.last_header()?;
        let behind = last.number < number || (last.number == number && last.hash != hash);
        if !behind {
            tracing::debug!(local = last.number, remote = number, "sync: up to date");
            return Ok(None);
        }
        tracing::info!(local = last.number, remote = number, "sync: started");
        self.syncing = true;
        Ok(Some(self.window(last, false)))
    }

    /// Feed a completed header-range task.
    pub fn on_headers(
        &mut self,
        from: &BlockHeader,
        headers: Vec<BlockHeader>,
        reverse: bool,
    ) -> Result<SyncStep, SyncError> {
        let result = if reverse {
            self.on_reversed(from, &headers)
        } else {
            self.on_forward(from, headers)
        };
        if !matches!(result, Ok(SyncStep::Request(_))) {
            self.syncing = false;
        }
        result
    }

    fn on_forward(
        &mut self,
        from: &BlockHeader,
        mut headers: Vec<BlockHeader>,
    ) -> Result<SyncStep, SyncError> {
        match validate_from_anchor(&headers, from, false) {
            Ok(()) => {}
            Err(ChainError::ForkDetected { .. }) => {
                tracing::info!(from = from.number, "sync: fork detected, requesting reversed headers");
                return Ok(SyncStep::Request(self.window(from.clone(), true)));
            }
            Err(error) => return Err(error.into()),
        }

        // the first header is the anchor itself
        let mut total = from.total_difficulty;
        headers[0].total_difficulty = total;
        for header in headers.iter_mut().skip(1) {
            total = total.saturating_add(header.difficulty);
            header.total_difficulty = total;
        }
        self.storage.save_headers(&headers)?;

        let full = headers.len() as u64 >= self.headers_limit;
        let Some(last) = headers.pop() else {
            return Err(ChainError::Empty.into());
        };
        tracing::debug!(head = last.number, full, "sync: headers stored");
        if full {
            Ok(SyncStep::Request(self.window(last, false)))
        } else {
            tracing::info!(head = last.number, "sync: complete");
            Ok(SyncStep::Synced(last))
        }
    }

    fn on_reversed(
        &mut self,
        from: &BlockHeader,
        headers: &[BlockHeader],
    ) -> Result<SyncStep, SyncError> {
        let mut stored = self
            .storage
            .reversed_headers(from.number, headers.len())?;
        if self.checkpoint.number <= from.number {
            stored.push(self.checkpoint.clone());
        }

        let forked = stored.into_iter().find(|ours| {
            headers
                .iter()
                .any(|theirs| theirs.hash == ours.hash && theirs.number == ours.number)
        });
        match forked {
            Some(common) => {
                tracing::info!(number = common.number, "sync: found fork point");
                Ok(SyncStep::Request(self.window(common, false)))
            }
            None => Err(SyncError::InvalidForkedPeer),
        }
    }

    /// The engine gave up on a sync task.
    pub fn on_task_failed(&mut self) {
        if self.syncing {
            tracing::warn!("sync: aborted");
        }
        self.syncing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethspv_protocol::U256;
    use ethspv_storage::MemoryStorage;

    fn header(number: u64, parent: H256, salt: u8) -> BlockHeader {
        BlockHeader {
            parent_hash: parent,
            number,
            difficulty: U256::from(10u64),
            extra_data: vec![salt],
            ..Default::default()
        }
        .with_computed_hash()
    }

    /// Chain from `start` (a header) with `count` descendants.
    fn extend(start: &BlockHeader, count: u64, salt: u8) -> Vec<BlockHeader> {
        let mut out = vec![start.clone()];
        for _ in 0..count {
            let prev = out.last().cloned().unwrap_or_default();
            out.push(header(prev.number + 1, prev.hash, salt));
        }
        out
    }

    fn checkpoint() -> BlockHeader {
        let mut h = header(100, H256::repeat_byte(0xaa), 0);
        h.total_difficulty = U256::from(1000u64);
        h
    }

    fn syncer(limit: u64) -> (Arc<MemoryStorage>, HeaderSyncer) {
        let storage = Arc::new(MemoryStorage::new());
        let syncer = HeaderSyncer::new(storage.clone(), checkpoint(), limit);
        (storage, syncer)
    }

    fn expect_request(step: SyncStep) -> (BlockHeader, bool) {
        match step {
            SyncStep::Request(Task::HeaderRange { from, reverse, .. }) => (from, reverse),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_starts_only_when_behind() {
        let (_, mut syncer) = syncer(3);
        let cp = checkpoint();
        assert!(syncer.on_peer_head(cp.hash, cp.number).unwrap().is_none());
        assert!(syncer.on_peer_head(H256::zero(), 90).unwrap().is_none());

        let task = syncer.on_peer_head(H256::zero(), 150).unwrap().unwrap();
        assert_eq!(task, Task::header_range(cp, 3, false));
        assert!(syncer.is_syncing());
        assert!(syncer.on_peer_head(H256::zero(), 160).unwrap().is_none());
    }

    #[test]
    fn test_same_height_other_hash_starts_sync() {
        let (_, mut syncer) = syncer(3);
        assert!(syncer.on_peer_head(H256::repeat_byte(9), 100).unwrap().is_some());
    }

    #[test]
    fn test_full_window_continues_then_short_window_completes() {
        let (storage, mut syncer) = syncer(3);
        let cp = checkpoint();
        syncer.on_peer_head(H256::zero(), 150).unwrap();

        let first = extend(&cp, 2, 1);
        let (next_from, reverse) = expect_request(syncer.on_headers(&cp, first.clone(), false).unwrap());
        assert!(!reverse);
        assert_eq!(next_from.hash, first[2].hash);
        assert_eq!(next_from.total_difficulty, U256::from(1020u64));
        assert_eq!(storage.last_header().unwrap().unwrap().number, 102);

        let second = extend(&next_from, 1, 1);
        match syncer.on_headers(&next_from, second, false).unwrap() {
            SyncStep::Synced(head) => {
                assert_eq!(head.number, 103);
                assert_eq!(head.total_difficulty, U256::from(1030u64));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!syncer.is_syncing());
    }

    #[test]
    fn test_fork_requests_reverse_window() {
        let (_, mut syncer) = syncer(3);
        let cp = checkpoint();
        syncer.on_peer_head(H256::zero(), 150).unwrap();

        let other_branch = extend(&header(100, H256::repeat_byte(0xbb), 9), 2, 9);
        let (from, reverse) = expect_request(syncer.on_headers(&cp, other_branch, false).unwrap());
        assert!(reverse);
        assert_eq!(from, cp);
        assert!(syncer.is_syncing());
    }

    #[test]
    fn test_reverse_batch_resumes_from_common_header() {
        let (storage, mut syncer) = syncer(3);
        let cp = checkpoint();
        let ours = extend(&cp, 2, 1);
        storage.save_headers(&ours).unwrap();

        // their 102 differs, 101 and 100 are shared
        let theirs_102 = header(102, ours[1].hash, 7);
        let reversed = vec![theirs_102, ours[1].clone(), ours[0].clone()];
        let (from, reverse) = expect_request(syncer.on_headers(&ours[2], reversed, true).unwrap());
        assert!(!reverse);
        assert_eq!(from.hash, ours[1].hash);
    }

    #[test]
    fn test_reverse_batch_without_common_header_fails() {
        let (_, mut syncer) = syncer(3);
        syncer.on_peer_head(H256::zero(), 150).unwrap();
        let stranger = extend(&header(100, H256::repeat_byte(0xbb), 9), 2, 9);
        assert!(matches!(
            syncer.on_headers(&checkpoint(), stranger, true),
            Err(SyncError::InvalidForkedPeer)
        ));
        assert!(!syncer.is_syncing());
    }

    #[test]
    fn test_broken_batch_aborts() {
        let (_, mut syncer) = syncer(3);
        let cp = checkpoint();
        syncer.on_peer_head(H256::zero(), 150).unwrap();
        let mut batch = extend(&cp, 2, 1);
        batch[2].number = 105;
        assert!(matches!(
            syncer.on_headers(&cp, batch, false),
            Err(SyncError::InvalidChain(ChainError::Gap { .. }))
        ));
        assert!(matches!(
            syncer.on_headers(&cp, Vec::new(), false),
            Err(SyncError::InvalidChain(ChainError::Empty))
        ));
        assert!(!syncer.is_syncing());
    }
}
