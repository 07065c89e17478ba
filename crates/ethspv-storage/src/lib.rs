//! ethspv Storage -- the load/save collaborator behind the light client.
//!
//! The sync engine only needs a flat key/value store. [`Storage`] is that
//! interface; [`ChainStorage`] layers typed access to headers, account
//! states and sent transactions on top of any implementation.
//!
//! Two backends: [`MemoryStorage`] for tests and ephemeral nodes, and
//! [`JsonFileStorage`], which keeps everything in one JSON document on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ethspv_protocol::messages::SignedTransaction;
use ethspv_protocol::rlp::{self, Encodable, Rlp, RlpError};
use ethspv_protocol::{AccountState, BlockHeader, ProtocolError, H256};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("rlp error: {0}")]
    Rlp(#[from] RlpError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("unsupported store version {found}, expected {expected}")]
    VersionMismatch { expected: u32, found: u32 },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Flat key/value storage. Implementations serialize their own mutations.
pub trait Storage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn save(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Returns whether the key existed.
    fn remove(&self, key: &str) -> Result<bool>;
    /// All keys starting with `prefix`, ascending.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

// ============================================================================
// Typed chain access
// ============================================================================

const HEAD_KEY: &str = "head";
const HEADER_PREFIX: &str = "header/";
const ACCOUNT_PREFIX: &str = "account/";
const TX_PREFIX: &str = "tx/";

fn header_key(number: u64) -> String {
    // zero padded so lexical key order is numeric order
    format!("{HEADER_PREFIX}{number:020}")
}

fn account_key(address: &[u8; 20]) -> String {
    format!("{ACCOUNT_PREFIX}{}", hex::encode(address))
}

fn tx_key(hash: &H256) -> String {
    format!("{TX_PREFIX}{}", hex::encode(hash.as_bytes()))
}

fn encode_header(header: &BlockHeader) -> Vec<u8> {
    Rlp::list(vec![header.to_rlp(), header.total_difficulty.to_rlp()]).rlp_bytes()
}

fn decode_header(key: &str, bytes: &[u8]) -> Result<BlockHeader> {
    let item = rlp::decode_exact(bytes)?;
    let f = item.fields(2)?;
    let mut header = BlockHeader::decode(&f[0])?;
    header.total_difficulty = f[1].as_u256()?;
    if header.hash.is_zero() {
        return Err(StorageError::Corrupt {
            key: key.to_string(),
            reason: "zero header hash".into(),
        });
    }
    Ok(header)
}

/// Headers, account states and transactions over any [`Storage`].
pub trait ChainStorage {
    fn last_header(&self) -> Result<Option<BlockHeader>>;
    fn header(&self, number: u64) -> Result<Option<BlockHeader>>;
    /// Up to `limit` stored headers at or below `from`, newest first.
    fn reversed_headers(&self, from: u64, limit: usize) -> Result<Vec<BlockHeader>>;
    /// Store headers; the head moves to the highest number written.
    fn save_headers(&self, headers: &[BlockHeader]) -> Result<()>;
    fn account_state(&self, address: &[u8; 20]) -> Result<Option<AccountState>>;
    /// Replaces whatever was stored for the address.
    fn save_account_state(&self, state: &AccountState) -> Result<()>;
    fn save_transaction(&self, tx: &SignedTransaction) -> Result<()>;
    fn transactions(&self) -> Result<Vec<SignedTransaction>>;
}

impl<S: Storage + ?Sized> ChainStorage for S {
    fn last_header(&self) -> Result<Option<BlockHeader>> {
        match self.load(HEAD_KEY)? {
            Some(bytes) => {
                let number = rlp::decode_exact(&bytes)?.as_u64()?;
                self.header(number)
            }
            None => Ok(None),
        }
    }

    fn header(&self, number: u64) -> Result<Option<BlockHeader>> {
        let key = header_key(number);
        self.load(&key)?
            .map(|bytes| decode_header(&key, &bytes))
            .transpose()
    }

    fn reversed_headers(&self, from: u64, limit: usize) -> Result<Vec<BlockHeader>> {
        let mut out = Vec::with_capacity(limit);
        let mut number = from;
        while out.len() < limit {
            match self.header(number)? {
                Some(header) => out.push(header),
                None => break,
            }
            if number == 0 {
                break;
            }
            number -= 1;
        }
        Ok(out)
    }

    fn save_headers(&self, headers: &[BlockHeader]) -> Result<()> {
        let Some(highest) = headers.iter().map(|h| h.number).max() else {
            return Ok(());
        };
        for header in headers {
            self.save(&header_key(header.number), &encode_header(header))?;
        }
        let head = match self.load(HEAD_KEY)? {
            Some(bytes) => rlp::decode_exact(&bytes)?.as_u64()?.max(highest),
            None => highest,
        };
        self.save(HEAD_KEY, &head.rlp_bytes())?;
        tracing::debug!(count = headers.len(), head, "storage: headers saved");
        Ok(())
    }

    fn account_state(&self, address: &[u8; 20]) -> Result<Option<AccountState>> {
        self.load(&account_key(address))?
            .map(|bytes| -> Result<AccountState> {
                Ok(AccountState::decode(*address, &rlp::decode_exact(&bytes)?)?)
            })
            .transpose()
    }

    fn save_account_state(&self, state: &AccountState) -> Result<()> {
        self.save(&account_key(&state.address), &state.rlp_bytes())
    }

    fn save_transaction(&self, tx: &SignedTransaction) -> Result<()> {
        self.save(&tx_key(&tx.hash()), &tx.rlp_bytes())
    }

    fn transactions(&self) -> Result<Vec<SignedTransaction>> {
        let mut out = Vec::new();
        for key in self.keys(TX_PREFIX)? {
            if let Some(bytes) = self.load(&key)? {
                out.push(SignedTransaction::decode(&rlp::decode_exact(&bytes)?)?);
            }
        }
        Ok(out)
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn keys_with_prefix(entries: &BTreeMap<String, Vec<u8>>, prefix: &str) -> Vec<String> {
    entries
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect()
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(keys_with_prefix(&self.entries.read(), prefix))
    }
}

// ============================================================================
// JSON file backend
// ============================================================================

const STORE_VERSION: u32 = 1;

/// On-disk document. Values are hex so the file stays readable.
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    updated_at: DateTime<Utc>,
    entries: BTreeMap<String, String>,
}

/// Whole-store-in-one-file persistence. Every mutation rewrites the file
/// through a temp file and rename.
pub struct JsonFileStorage {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl JsonFileStorage {
    /// Open the store at `path`, creating parent directories. A missing file
    /// is an empty store.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let entries = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let file: StoreFile = serde_json::from_str(&text)?;
            if file.version != STORE_VERSION {
                return Err(StorageError::VersionMismatch {
                    expected: STORE_VERSION,
                    found: file.version,
                });
            }
            let mut entries = BTreeMap::new();
            for (key, value) in file.entries {
                let bytes = hex::decode(&value).map_err(|e| StorageError::Corrupt {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
                entries.insert(key, bytes);
            }
            tracing::info!(path = %path.display(), entries = entries.len(), "storage: opened");
            entries
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let file = StoreFile {
            version: STORE_VERSION,
            updated_at: Utc::now(),
            entries: entries
                .iter()
                .map(|(k, v)| (k.clone(), hex::encode(v)))
                .collect(),
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Storage for JsonFileStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value.to_vec());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write();
        let existed = entries.remove(key).is_some();
        if existed {
            self.flush(&entries)?;
        }
        Ok(existed)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(keys_with_prefix(&self.entries.read(), prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethspv_protocol::messages::{RawTransaction, TransactionSignature};
    use ethspv_protocol::U256;

    fn make_header(number: u64, parent: H256) -> BlockHeader {
        BlockHeader {
            parent_hash: parent,
            number,
            difficulty: U256::from(1000u64),
            total_difficulty: U256::from(1000u64 * (number + 1)),
            ..Default::default()
        }
        .with_computed_hash()
    }

    fn chain(from: u64, count: u64) -> Vec<BlockHeader> {
        let mut parent = H256::repeat_byte(0xaa);
        (from..from + count)
            .map(|n| {
                let h = make_header(n, parent);
                parent = h.hash;
                h
            })
            .collect()
    }

    #[test]
    fn test_load_missing_is_none() {
        let storage = MemoryStorage::new();
        assert!(storage.load("nope").unwrap().is_none());
        assert!(!storage.remove("nope").unwrap());
    }

    #[test]
    fn test_save_overwrites() {
        let storage = MemoryStorage::new();
        storage.save("k", b"one").unwrap();
        storage.save("k", b"two").unwrap();
        assert_eq!(storage.load("k").unwrap().unwrap(), b"two");
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_keys_by_prefix() {
        let storage = MemoryStorage::new();
        storage.save("a/1", b"").unwrap();
        storage.save("b/1", b"").unwrap();
        storage.save("a/2", b"").unwrap();
        assert_eq!(storage.keys("a/").unwrap(), vec!["a/1", "a/2"]);
    }

    #[test]
    fn test_headers_roundtrip_with_total_difficulty() {
        let storage = MemoryStorage::new();
        let headers = chain(100, 3);
        storage.save_headers(&headers).unwrap();

        let last = storage.last_header().unwrap().unwrap();
        assert_eq!(last, headers[2]);
        assert_eq!(last.total_difficulty, U256::from(103_000u64));
        assert_eq!(storage.header(101).unwrap().unwrap().hash, headers[1].hash);
    }

    #[test]
    fn test_reversed_headers_stop_at_gap() {
        let storage = MemoryStorage::new();
        storage.save_headers(&chain(10, 5)).unwrap();

        let reversed = storage.reversed_headers(14, 3).unwrap();
        let numbers: Vec<u64> = reversed.iter().map(|h| h.number).collect();
        assert_eq!(numbers, vec![14, 13, 12]);

        assert_eq!(storage.reversed_headers(14, 50).unwrap().len(), 5);
        assert!(storage.reversed_headers(20, 5).unwrap().is_empty());
    }

    #[test]
    fn test_head_never_moves_backwards() {
        let storage = MemoryStorage::new();
        storage.save_headers(&chain(10, 5)).unwrap();
        storage.save_headers(&chain(3, 2)).unwrap();
        assert_eq!(storage.last_header().unwrap().unwrap().number, 14);
    }

    #[test]
    fn test_account_state_superseded() {
        let storage = MemoryStorage::new();
        let mut state = AccountState {
            address: [7; 20],
            nonce: 1,
            balance: U256::from(10u64),
            storage_root: H256::repeat_byte(1),
            code_hash: H256::repeat_byte(2),
        };
        storage.save_account_state(&state).unwrap();
        state.nonce = 2;
        storage.save_account_state(&state).unwrap();
        assert_eq!(storage.account_state(&[7; 20]).unwrap(), Some(state));
        assert!(storage.account_state(&[8; 20]).unwrap().is_none());
    }

    #[test]
    fn test_transactions_listed() {
        let storage = MemoryStorage::new();
        let tx = SignedTransaction {
            raw: RawTransaction {
                nonce: 0,
                gas_price: U256::from(1_000_000_000u64),
                gas_limit: 21_000,
                to: vec![0x11; 20],
                value: U256::from(5u64),
                data: Vec::new(),
            },
            signature: TransactionSignature {
                v: 27,
                r: U256::from(1u64),
                s: U256::from(2u64),
            },
        };
        storage.save_transaction(&tx).unwrap();
        assert_eq!(storage.transactions().unwrap(), vec![tx]);
    }

    #[test]
    fn test_json_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain").join("store.json");
        {
            let storage = JsonFileStorage::open(&path).unwrap();
            storage.save_headers(&chain(0, 2)).unwrap();
            storage.save("misc", b"\x01\x02").unwrap();
        }
        let storage = JsonFileStorage::open(&path).unwrap();
        assert_eq!(storage.last_header().unwrap().unwrap().number, 1);
        assert_eq!(storage.load("misc").unwrap().unwrap(), vec![1, 2]);
        assert!(storage.remove("misc").unwrap());

        let reopened = JsonFileStorage::open(&path).unwrap();
        assert!(reopened.load("misc").unwrap().is_none());
    }

    #[test]
    fn test_json_file_rejects_other_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(
            &path,
            r#"{"version":9,"updated_at":"2024-01-01T00:00:00Z","entries":{}}"#,
        )
        .unwrap();
        assert!(matches!(
            JsonFileStorage::open(&path),
            Err(StorageError::VersionMismatch { found: 9, .. })
        ));
    }

    #[test]
    fn test_dyn_storage_gets_chain_access() {
        let storage: std::sync::Arc<dyn Storage> = std::sync::Arc::new(MemoryStorage::new());
        storage.save_headers(&chain(0, 1)).unwrap();
        assert!(storage.last_header().unwrap().is_some());
    }
}
