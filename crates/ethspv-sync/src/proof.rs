//! Account proof verification against a header's state root.
//!
//! A proof is the list of state-trie nodes from the root down to the
//! account leaf. Verification walks it bottom-up: the leaf yields the
//! account and the tail of its path, and each node above must reference the
//! hash of the node below it, contributing a branch nibble or an extension
//! path. The collected path must spell `keccak(address)` and the top node
//! must hash to the state root.

use ethspv_protocol::rlp::{self, Rlp};
use ethspv_protocol::{keccak256, AccountState, H256};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    #[error("proof has no nodes")]
    NoNodes,
    #[error("last proof node is not an account leaf")]
    StateNodeNotFound,
    #[error("proof node {0} does not reference the node below it")]
    NodesNotInterconnected(usize),
    #[error("proof path does not match the address hash")]
    PathMismatch,
    #[error("proof root does not match the state root")]
    RootMismatch,
    #[error("malformed account state: {0}")]
    WrongState(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Branch,
    Extension,
    Leaf,
}

const BRANCH_WIDTH: usize = 17;

/// One decoded trie node.
struct TrieNode<'a> {
    kind: NodeKind,
    hash: H256,
    items: &'a [Rlp],
    /// Nibbles of the hex-prefix path for leaf and extension nodes.
    path: Vec<u8>,
}

impl<'a> TrieNode<'a> {
    fn parse(node: &'a Rlp) -> Option<Self> {
        let items = node.as_list().ok()?;
        let hash = keccak256(&node.encoded());
        if items.len() == BRANCH_WIDTH {
            return Some(Self {
                kind: NodeKind::Branch,
                hash,
                items,
                path: Vec::new(),
            });
        }
        if items.len() != 2 {
            return None;
        }

        let encoded = items[0].as_bytes().ok()?;
        let (&first, rest) = encoded.split_first()?;
        let kind = match first >> 4 {
            0 | 1 => NodeKind::Extension,
            2 | 3 => NodeKind::Leaf,
            _ => return None,
        };
        let mut path = Vec::with_capacity(rest.len() * 2 + 1);
        // odd-length paths keep their first nibble in the flag byte
        if first & 0x10 != 0 {
            path.push(first & 0x0f);
        }
        for byte in rest {
            path.push(byte >> 4);
            path.push(byte & 0x0f);
        }
        Some(Self {
            kind,
            hash,
            items,
            path,
        })
    }

    /// Path contributed by this node on the way to `child`.
    fn path_to(&self, child: &H256) -> Option<Vec<u8>> {
        let references = |item: &Rlp| item.as_bytes().map(|b| b == child.as_bytes()).unwrap_or(false);
        match self.kind {
            NodeKind::Branch => self.items[..16]
                .iter()
                .position(references)
                .map(|slot| vec![slot as u8]),
            NodeKind::Extension if references(&self.items[1]) => Some(self.path.clone()),
            _ => None,
        }
    }
}

fn nibbles(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().flat_map(|b| [b >> 4, b & 0x0f]).collect()
}

/// Verify `nodes` proves the account at `address` under `state_root`.
pub fn verify_account_proof(
    address: &[u8; 20],
    state_root: &H256,
    nodes: &[Rlp],
) -> Result<AccountState, ProofError> {
    let leaf_rlp = nodes.last().ok_or(ProofError::NoNodes)?;
    let leaf = TrieNode::parse(leaf_rlp)
        .filter(|n| n.kind == NodeKind::Leaf)
        .ok_or(ProofError::StateNodeNotFound)?;

    let value = leaf.items[1]
        .as_bytes()
        .map_err(|e| ProofError::WrongState(e.to_string()))?;
    let state = rlp::decode_exact(value)
        .and_then(|item| AccountState::decode(*address, &item))
        .map_err(|e| ProofError::WrongState(e.to_string()))?;

    let mut path = leaf.path.clone();
    let mut child = leaf.hash;
    for index in (0..nodes.len() - 1).rev() {
        let node = TrieNode::parse(&nodes[index]).ok_or(ProofError::NodesNotInterconnected(index))?;
        let mut prefix = node
            .path_to(&child)
            .ok_or(ProofError::NodesNotInterconnected(index))?;
        prefix.extend_from_slice(&path);
        path = prefix;
        child = node.hash;
    }

    if path != nibbles(keccak256(address).as_bytes()) {
        return Err(ProofError::PathMismatch);
    }
    if child != *state_root {
        return Err(ProofError::RootMismatch);
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethspv_protocol::{Encodable, U256};

    const ADDRESS: [u8; 20] = [0x42; 20];

    fn account() -> AccountState {
        AccountState {
            address: ADDRESS,
            nonce: 7,
            balance: U256::from(1_000_000u64),
            storage_root: H256::repeat_byte(0x56),
            code_hash: H256::repeat_byte(0xc5),
        }
    }

    /// Hex-prefix encode a nibble path.
    fn hex_prefix(path: &[u8], leaf: bool) -> Vec<u8> {
        let flag = if leaf { 0x20 } else { 0x00 };
        let mut out = Vec::new();
        let rest = if path.len() % 2 == 1 {
            out.push(flag | 0x10 | path[0]);
            &path[1..]
        } else {
            out.push(flag);
            path
        };
        for pair in rest.chunks(2) {
            out.push((pair[0] << 4) | pair[1]);
        }
        out
    }

    fn leaf(path: &[u8]) -> Rlp {
        Rlp::list(vec![
            Rlp::String(hex_prefix(path, true)),
            Rlp::String(account().rlp_bytes()),
        ])
    }

    fn hash_of(node: &Rlp) -> H256 {
        keccak256(&node.encoded())
    }

    fn key() -> Vec<u8> {
        nibbles(keccak256(&ADDRESS).as_bytes())
    }

    fn branch_with(slot: u8, child: &Rlp) -> Rlp {
        let mut items = vec![Rlp::empty(); 17];
        items[slot as usize] = Rlp::String(hash_of(child).as_bytes().to_vec());
        Rlp::list(items)
    }

    #[test]
    fn test_single_leaf_proof() {
        let leaf = leaf(&key());
        let root = hash_of(&leaf);
        assert_eq!(verify_account_proof(&ADDRESS, &root, &[leaf]).unwrap(), account());
    }

    #[test]
    fn test_branch_then_leaf() {
        let key = key();
        let leaf = leaf(&key[1..]);
        let branch = branch_with(key[0], &leaf);
        let root = hash_of(&branch);
        assert_eq!(
            verify_account_proof(&ADDRESS, &root, &[branch, leaf]).unwrap(),
            account()
        );
    }

    #[test]
    fn test_extension_branch_leaf() {
        let key = key();
        let leaf = leaf(&key[4..]);
        let branch = branch_with(key[3], &leaf);
        let extension = Rlp::list(vec![
            Rlp::String(hex_prefix(&key[..3], false)),
            Rlp::String(hash_of(&branch).as_bytes().to_vec()),
        ]);
        let root = hash_of(&extension);
        assert!(verify_account_proof(&ADDRESS, &root, &[extension, branch, leaf]).is_ok());
    }

    #[test]
    fn test_wrong_root_rejected() {
        let leaf = leaf(&key());
        assert_eq!(
            verify_account_proof(&ADDRESS, &H256::repeat_byte(9), &[leaf]),
            Err(ProofError::RootMismatch)
        );
    }

    #[test]
    fn test_wrong_branch_slot_rejected() {
        let key = key();
        let leaf = leaf(&key[1..]);
        let branch = branch_with((key[0] + 1) % 16, &leaf);
        let root = hash_of(&branch);
        assert_eq!(
            verify_account_proof(&ADDRESS, &root, &[branch, leaf]),
            Err(ProofError::PathMismatch)
        );
    }

    #[test]
    fn test_disconnected_nodes_rejected() {
        let key = key();
        let leaf = leaf(&key[1..]);
        let unrelated = leaf_for_other();
        let branch = branch_with(key[0], &unrelated);
        assert_eq!(
            verify_account_proof(&ADDRESS, &hash_of(&branch), &[branch, leaf]),
            Err(ProofError::NodesNotInterconnected(0))
        );
    }

    fn leaf_for_other() -> Rlp {
        Rlp::list(vec![Rlp::String(vec![0x20, 0x01]), Rlp::String(vec![0x80])])
    }

    #[test]
    fn test_empty_and_non_leaf() {
        assert_eq!(
            verify_account_proof(&ADDRESS, &H256::zero(), &[]),
            Err(ProofError::NoNodes)
        );
        let branch = Rlp::list(vec![Rlp::empty(); 17]);
        assert_eq!(
            verify_account_proof(&ADDRESS, &H256::zero(), &[branch]),
            Err(ProofError::StateNodeNotFound)
        );
    }

    #[test]
    fn test_malformed_account_value() {
        let node = Rlp::list(vec![
            Rlp::String(hex_prefix(&key(), true)),
            Rlp::String(Rlp::list(vec![Rlp::empty()]).rlp_bytes()),
        ]);
        assert!(matches!(
            verify_account_proof(&ADDRESS, &hash_of(&node), &[node]),
            Err(ProofError::WrongState(_))
        ));
    }
}
