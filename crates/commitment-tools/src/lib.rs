//! Synthetic workloads shared by the commitment profiler and benches.
use openvm_commitment::{
    BranchUpdates, CommitmentError, HexPatriciaHashed, InMemoryState, Update, UpdateBuilder,
};
use revm_primitives::{B256, U256, keccak256};

pub const ACCOUNT_KEY_LEN: usize = 20;

pub type MemoryEngine = HexPatriciaHashed<InMemoryState, InMemoryState, InMemoryState>;

/// Plain keys with their updates, in the order they were generated.
#[derive(Debug, Clone)]
pub struct Workload {
    pub keys: Vec<Vec<u8>>,
    pub updates: Vec<Update>,
}

impl Workload {
    /// `accounts` funded accounts, each with `slots_per_account` storage slots. The same seed
    /// always yields the same workload.
    pub fn generate(
        accounts: u64,
        slots_per_account: u64,
        seed: u64,
    ) -> Result<Self, CommitmentError> {
        let mut builder = UpdateBuilder::new(ACCOUNT_KEY_LEN);
        for i in 0..accounts {
            let address = &digest(seed, i, u64::MAX)[..ACCOUNT_KEY_LEN];
            builder = builder
                .balance(address, U256::from_be_slice(&digest(seed, i, 0)[..10]))
                .nonce(address, i);
            for j in 0..slots_per_account {
                let location = digest(seed ^ 1, i, j);
                let value = digest(seed ^ 2, i, j);
                // storage values are stored without leading zero bytes
                let start = value.iter().position(|&b| b != 0).unwrap_or(31);
                builder = builder.storage(address, location, &value[start..]);
            }
        }
        let (keys, updates) = builder.build()?;
        Ok(Self { keys, updates })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn digest(seed: u64, i: u64, j: u64) -> B256 {
    let mut input = [0u8; 24];
    input[..8].copy_from_slice(&seed.to_be_bytes());
    input[8..16].copy_from_slice(&i.to_be_bytes());
    input[16..].copy_from_slice(&j.to_be_bytes());
    keccak256(input)
}

pub fn engine(state: &InMemoryState) -> Result<MemoryEngine, CommitmentError> {
    HexPatriciaHashed::new(ACCOUNT_KEY_LEN, state.clone(), state.clone(), state.clone())
}

/// Commits the whole workload in one pass and persists the result.
pub fn commit_batch(
    hph: &mut MemoryEngine,
    state: &InMemoryState,
    workload: &Workload,
) -> Result<(B256, BranchUpdates), CommitmentError> {
    let (root, branch_updates) = hph.process_updates(&workload.keys, &workload.updates)?;
    state.apply_plain_updates(&workload.keys, &workload.updates)?;
    state.apply_branch_node_updates(&branch_updates)?;
    Ok((root, branch_updates))
}

/// Commits the workload in `chunks` passes through `process_keys`. The keys are ordered globally
/// by hashed key first, so each pass continues where the previous one stopped.
pub fn commit_chunked(
    hph: &mut MemoryEngine,
    state: &InMemoryState,
    workload: &Workload,
    chunks: usize,
) -> Result<B256, CommitmentError> {
    let mut order: Vec<usize> = (0..workload.len()).collect();
    order.sort_by(|&a, &b| workload.updates[a].hashed_key.cmp(&workload.updates[b].hashed_key));
    let keys: Vec<&[u8]> = order.iter().map(|&i| workload.keys[i].as_slice()).collect();
    let updates: Vec<Update> = order.iter().map(|&i| workload.updates[i].clone()).collect();

    let chunk_len = workload.len().div_ceil(chunks.max(1)).max(1);
    let mut root = hph.root_hash();
    for (keys, updates) in keys.chunks(chunk_len).zip(updates.chunks(chunk_len)) {
        state.apply_plain_updates(keys, updates)?;
        let (chunk_root, branch_updates) = hph.process_keys(keys)?;
        state.apply_branch_node_updates(&branch_updates)?;
        root = chunk_root;
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_is_deterministic() {
        let one = Workload::generate(16, 2, 7).unwrap();
        let two = Workload::generate(16, 2, 7).unwrap();
        assert_eq!(one.keys, two.keys);
        assert_eq!(one.len(), 16 * 3);
        assert_ne!(Workload::generate(16, 2, 8).unwrap().keys, one.keys);
    }

    #[test]
    fn test_batch_and_chunked_agree() {
        let workload = Workload::generate(64, 2, 1).unwrap();

        let batch_state = InMemoryState::new(ACCOUNT_KEY_LEN);
        let mut batch = engine(&batch_state).unwrap();
        let (batch_root, _) = commit_batch(&mut batch, &batch_state, &workload).unwrap();

        let chunked_state = InMemoryState::new(ACCOUNT_KEY_LEN);
        let mut chunked = engine(&chunked_state).unwrap();
        let chunked_root = commit_chunked(&mut chunked, &chunked_state, &workload, 9).unwrap();

        assert_eq!(batch_root, chunked_root);
        assert_eq!(batch_state.branch_count(), chunked_state.branch_count());
    }
}
