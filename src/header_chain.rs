use std::collections::HashMap;

use tracing::trace;

use crate::models::blockchain::BlockHeader;
use crate::models::blockchain::Sha256dHash;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HeaderChainError {
    #[error("header connects to unknown parent {0}")]
    UnknownParent(Sha256dHash),
}

#[derive(Clone, Copy, Debug)]
struct StoredHeader {
    height: u64,
    prev: Sha256dHash,
}

/// In-memory header tree rooted at genesis. The relay engine uses it for two
/// things only: deduplicating blocks by hash and tracking the tip height for
/// the status panel. No difficulty or timestamp validation happens here.
#[derive(Debug)]
pub struct HeaderChain {
    headers: HashMap<Sha256dHash, StoredHeader>,
    /// Best-chain height index, used to build block locators.
    by_height: HashMap<u64, Sha256dHash>,
    tip_hash: Sha256dHash,
    tip_height: u64,
}

impl HeaderChain {
    pub fn new() -> Self {
        let genesis = BlockHeader::genesis();
        let genesis_hash = genesis.hash();
        let mut headers = HashMap::new();
        headers.insert(
            genesis_hash,
            StoredHeader {
                height: 0,
                prev: genesis.prev_block_hash,
            },
        );
        let mut by_height = HashMap::new();
        by_height.insert(0, genesis_hash);
        Self {
            headers,
            by_height,
            tip_hash: genesis_hash,
            tip_height: 0,
        }
    }

    pub fn contains(&self, hash: &Sha256dHash) -> bool {
        self.headers.contains_key(hash)
    }

    pub fn best_height(&self) -> u64 {
        self.tip_height
    }

    pub fn tip_hash(&self) -> Sha256dHash {
        self.tip_hash
    }

    /// Connect a header to the tree. Returns true if the header was new,
    /// false if it was already known.
    pub fn add_header(&mut self, header: &BlockHeader) -> Result<bool, HeaderChainError> {
        let hash = header.hash();
        if self.headers.contains_key(&hash) {
            return Ok(false);
        }

        let parent = self
            .headers
            .get(&header.prev_block_hash)
            .copied()
            .ok_or(HeaderChainError::UnknownParent(header.prev_block_hash))?;

        let height = parent.height + 1;
        self.headers.insert(
            hash,
            StoredHeader {
                height,
                prev: header.prev_block_hash,
            },
        );
        self.by_height.insert(height, hash);
        if height > self.tip_height {
            self.tip_height = height;
            self.tip_hash = hash;
        }

        Ok(true)
    }

    /// Connect a batch from a headers-download response, best effort: headers
    /// that do not connect are skipped. Returns how many were new.
    pub fn add_headers(&mut self, headers: &[BlockHeader]) -> usize {
        let mut added = 0;
        for header in headers {
            match self.add_header(header) {
                Ok(true) => added += 1,
                Ok(false) => (),
                Err(e) => trace!("Skipping header in download batch: {}", e),
            }
        }
        added
    }

    /// Block locator for a headers request: dense near the tip, then
    /// exponentially sparser back to genesis.
    pub fn locator(&self) -> Vec<Sha256dHash> {
        let mut hashes = vec![];
        let mut step = 1u64;
        let mut height = self.tip_height as i64;
        while height > 0 {
            if let Some(hash) = self.by_height.get(&(height as u64)) {
                hashes.push(*hash);
            }
            if hashes.len() >= 10 {
                step *= 2;
            }
            height -= step as i64;
        }
        if let Some(genesis) = self.by_height.get(&0) {
            hashes.push(*genesis);
        }
        hashes
    }
}

impl Default for HeaderChain {
    fn default() -> Self {
        Self::new()
    }
}
