//! Header batch continuity checks.

use ethspv_protocol::BlockHeader;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("empty header batch")]
    Empty,

    #[error("header {index} has number {got}, expected {expected}")]
    Gap { index: usize, expected: u64, got: u64 },

    #[error("header {index} does not link to its predecessor")]
    BrokenLink { index: usize },

    #[error("{got} headers returned, at most {limit} requested")]
    Oversized { limit: u64, got: usize },

    /// First header isn't the anchor we asked from.
    #[error("batch starts at {got}, anchor is {expected}")]
    ForkDetected { expected: String, got: String },
}

/// Check a batch is one unbroken chain.
///
/// Forward batches climb by one with each header's parent hash naming its
/// predecessor; reverse batches descend, so each predecessor names the next
/// header as its parent. Any violation rejects the whole batch.
pub fn validate_chain(headers: &[BlockHeader], reverse: bool) -> Result<(), ChainError> {
    for (index, pair) in headers.windows(2).enumerate() {
        let (prev, next) = (&pair[0], &pair[1]);
        let expected = if reverse {
            prev.number.checked_sub(1)
        } else {
            prev.number.checked_add(1)
        };
        if expected != Some(next.number) {
            return Err(ChainError::Gap {
                index: index + 1,
                expected: expected.unwrap_or_default(),
                got: next.number,
            });
        }
        let linked = if reverse {
            prev.parent_hash == next.hash
        } else {
            next.parent_hash == prev.hash
        };
        if !linked {
            return Err(ChainError::BrokenLink { index: index + 1 });
        }
    }
    Ok(())
}

/// Validate a batch requested from `anchor`: it must start with the anchor
/// itself and be continuous from there.
pub fn validate_from_anchor(
    headers: &[BlockHeader],
    anchor: &BlockHeader,
    reverse: bool,
) -> Result<(), ChainError> {
    let first = headers.first().ok_or(ChainError::Empty)?;
    if first.hash != anchor.hash {
        return Err(ChainError::ForkDetected {
            expected: anchor.hash_hex(),
            got: first.hash_hex(),
        });
    }
    validate_chain(headers, reverse)
}
