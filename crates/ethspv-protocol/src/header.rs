//! Chain data carried by LES responses: block headers and account state.

use primitive_types::{H256, U256};

use crate::keccak256;
use crate::rlp::{self, Encodable, Rlp};

/// Fields in a pre-London header; later forks append more, which are kept
/// out of the struct but still covered by `hash`.
const HEADER_FIELDS: usize = 15;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHeader {
    /// keccak of the header as received.
    pub hash: H256,
    pub parent_hash: H256,
    pub uncles_hash: H256,
    pub coinbase: [u8; 20],
    pub state_root: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub logs_bloom: Vec<u8>,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub mix_hash: H256,
    pub nonce: [u8; 8],
    /// Cumulative difficulty up to and including this header. Not on the
    /// wire; filled in by whoever links the header into a chain.
    pub total_difficulty: U256,
}

impl BlockHeader {
    pub fn decode(item: &Rlp) -> rlp::Result<Self> {
        let f = item.fields(HEADER_FIELDS)?;
        Ok(Self {
            hash: keccak256(&item.encoded()),
            parent_hash: f[0].as_h256()?,
            uncles_hash: f[1].as_h256()?,
            coinbase: f[2].as_fixed()?,
            state_root: f[3].as_h256()?,
            transactions_root: f[4].as_h256()?,
            receipts_root: f[5].as_h256()?,
            logs_bloom: f[6].as_bytes()?.to_vec(),
            difficulty: f[7].as_u256()?,
            number: f[8].as_u64()?,
            gas_limit: f[9].as_u64()?,
            gas_used: f[10].as_u64()?,
            timestamp: f[11].as_u64()?,
            extra_data: f[12].as_bytes()?.to_vec(),
            mix_hash: f[13].as_h256()?,
            nonce: f[14].as_fixed()?,
            total_difficulty: U256::zero(),
        })
    }

    /// Recompute `hash` from the encoded fields.
    pub fn with_computed_hash(mut self) -> Self {
        self.hash = keccak256(&self.rlp_bytes());
        self
    }

    /// Short hex of the hash for log lines.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash.as_bytes())
    }
}

impl Encodable for BlockHeader {
    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            self.parent_hash.to_rlp(),
            self.uncles_hash.to_rlp(),
            self.coinbase.to_rlp(),
            self.state_root.to_rlp(),
            self.transactions_root.to_rlp(),
            self.receipts_root.to_rlp(),
            self.logs_bloom.to_rlp(),
            self.difficulty.to_rlp(),
            self.number.to_rlp(),
            self.gas_limit.to_rlp(),
            self.gas_used.to_rlp(),
            self.timestamp.to_rlp(),
            self.extra_data.to_rlp(),
            self.mix_hash.to_rlp(),
            self.nonce.to_rlp(),
        ])
    }
}

/// Account state as stored in the state trie leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    pub address: [u8; 20],
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: H256,
    pub code_hash: H256,
}

impl AccountState {
    /// Decode the `[nonce, balance, storage_root, code_hash]` leaf value.
    pub fn decode(address: [u8; 20], item: &Rlp) -> rlp::Result<Self> {
        let f = item.as_list()?;
        if f.len() != 4 {
            return Err(rlp::RlpError::InvalidLength {
                expected: 4,
                got: f.len(),
            });
        }
        Ok(Self {
            address,
            nonce: f[0].as_u64()?,
            balance: f[1].as_u256()?,
            storage_root: f[2].as_h256()?,
            code_hash: f[3].as_h256()?,
        })
    }
}

impl Encodable for AccountState {
    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![
            self.nonce.to_rlp(),
            self.balance.to_rlp(),
            self.storage_root.to_rlp(),
            self.code_hash.to_rlp(),
        ])
    }
}
