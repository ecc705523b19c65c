use std::collections::BTreeMap;

use openvm_commitment::{
    Account, BranchUpdates, CommitmentError, HexPatriciaHashed, InMemoryState, Update,
    UpdateBuilder,
};
use reth_trie::{EMPTY_ROOT_HASH, HashBuilder, Nibbles, TrieAccount};
use revm_primitives::{B256, U256, keccak256};
use tracing_subscriber::{
    filter::EnvFilter, fmt, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

const ACCOUNT_KEY_LEN: usize = 20;

type Engine = HexPatriciaHashed<InMemoryState, InMemoryState, InMemoryState>;

fn init_logger() {
    dotenv::dotenv().ok();
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

fn engine(state: &InMemoryState) -> Engine {
    HexPatriciaHashed::new(ACCOUNT_KEY_LEN, state.clone(), state.clone(), state.clone())
        .expect("valid account key length")
}

/// Plain state the tests expect, used to compute reference roots.
#[derive(Debug, Default)]
struct Model {
    accounts: BTreeMap<Vec<u8>, (Account, BTreeMap<Vec<u8>, Vec<u8>>)>,
}

impl Model {
    fn root(&self) -> B256 {
        let leaves = self.accounts.iter().map(|(address, (account, slots))| {
            let account = TrieAccount {
                nonce: account.nonce,
                balance: account.balance,
                storage_root: storage_root(slots),
                code_hash: account.code_hash,
            };
            (keccak256(address), alloy_rlp::encode(account))
        });
        reference_root(leaves)
    }
}

fn storage_root(slots: &BTreeMap<Vec<u8>, Vec<u8>>) -> B256 {
    reference_root(
        slots.iter().map(|(location, value)| (keccak256(location), alloy_rlp::encode(&value[..]))),
    )
}

fn reference_root(leaves: impl Iterator<Item = (B256, Vec<u8>)>) -> B256 {
    let mut leaves: Vec<_> = leaves.collect();
    leaves.sort_by_key(|(key, _)| *key);
    let mut hb = HashBuilder::default();
    for (key, value) in &leaves {
        hb.add_leaf(Nibbles::unpack(key), value);
    }
    hb.root()
}

fn digest(tag: &[u8], i: u64, j: u64) -> B256 {
    keccak256([tag, &i.to_be_bytes()[..], &j.to_be_bytes()[..]].concat())
}

fn address(i: u64) -> Vec<u8> {
    digest(b"address", i, 0)[..ACCOUNT_KEY_LEN].to_vec()
}

fn location(i: u64, j: u64) -> Vec<u8> {
    digest(b"location", i, j).to_vec()
}

/// Non-empty slot value without leading zero bytes.
fn slot_value(i: u64, j: u64, round: u64) -> Vec<u8> {
    let h = digest(b"value", i * 31 + round, j);
    let mut value = h[..1 + h[0] as usize % 32].to_vec();
    value[0] |= 1;
    value
}

fn balance(i: u64, round: u64) -> U256 {
    U256::from_be_slice(&digest(b"balance", i, round)[..12])
}

/// First round: fresh accounts, every third one with a few storage slots.
fn genesis(model: &mut Model, accounts: u64) -> UpdateBuilder {
    let mut builder = UpdateBuilder::new(ACCOUNT_KEY_LEN);
    for i in 0..accounts {
        let address = address(i);
        let account = Account { nonce: i, balance: balance(i, 0), ..Default::default() };
        builder = builder.balance(&address, account.balance).nonce(&address, account.nonce);

        let mut slots = BTreeMap::new();
        if i % 3 == 0 {
            for j in 0..=i % 4 {
                let (location, value) = (location(i, j), slot_value(i, j, 0));
                builder = builder.storage(&address, &location, &value);
                slots.insert(location, value);
            }
        }
        model.accounts.insert(address, (account, slots));
    }
    builder
}

/// Second round: balance increments, slot rewrites and deletions, deleted and new accounts.
fn next_round(model: &mut Model, accounts: u64) -> UpdateBuilder {
    let mut builder = UpdateBuilder::new(ACCOUNT_KEY_LEN);
    for i in 0..accounts {
        let address = address(i);
        let Some((account, slots)) = model.accounts.get_mut(&address) else { continue };
        if i % 5 == 0 {
            let delta = U256::from(i + 1);
            builder = builder.increment_balance(&address, delta);
            account.balance += delta;
        } else if i % 7 == 1 {
            builder = builder.delete(&address);
            for location in slots.keys() {
                builder = builder.delete([&address[..], &location[..]].concat());
            }
            model.accounts.remove(&address);
            continue;
        }
        if i % 3 == 0 {
            let first = location(i, 0);
            if i % 2 == 0 {
                builder = builder.delete([&address[..], &first[..]].concat());
                slots.remove(&first);
            } else {
                let value = slot_value(i, 0, 1);
                builder = builder.storage(&address, &first, &value);
                slots.insert(first, value);
            }
        }
    }
    for i in accounts..accounts + 8 {
        let address = address(i);
        let account = Account { balance: balance(i, 1), ..Default::default() };
        let location = location(i, 0);
        let value = slot_value(i, 0, 1);
        builder = builder.balance(&address, account.balance).storage(&address, &location, &value);
        model.accounts.insert(address, (account, BTreeMap::from([(location, value)])));
    }
    builder
}

fn commit_updates(
    hph: &mut Engine,
    state: &InMemoryState,
    keys: &[Vec<u8>],
    updates: &[Update],
) -> Result<(B256, BranchUpdates), CommitmentError> {
    let (root, branch_updates) = hph.process_updates(keys, updates)?;
    state.apply_plain_updates(keys, updates)?;
    state.apply_branch_node_updates(&branch_updates)?;
    Ok((root, branch_updates))
}

/// Commits through `process_keys` a few keys at a time.
fn commit_chunked(
    hph: &mut Engine,
    state: &InMemoryState,
    keys: &[Vec<u8>],
    updates: &[Update],
    chunk: usize,
) -> Result<B256, CommitmentError> {
    let mut root = hph.root_hash();
    for (keys, updates) in keys.chunks(chunk).zip(updates.chunks(chunk)) {
        state.apply_plain_updates(keys, updates)?;
        let (chunk_root, branch_updates) = hph.process_keys(keys)?;
        state.apply_branch_node_updates(&branch_updates)?;
        root = chunk_root;
    }
    Ok(root)
}

#[test]
fn test_roots_match_reference_across_rounds() -> Result<(), CommitmentError> {
    init_logger();
    const ACCOUNTS: u64 = 48;

    let mut model = Model::default();
    let (keys, updates) = genesis(&mut model, ACCOUNTS).build()?;

    let batch_state = InMemoryState::new(ACCOUNT_KEY_LEN);
    let mut batch = engine(&batch_state);
    let (batch_root, _) = commit_updates(&mut batch, &batch_state, &keys, &updates)?;

    let chunked_state = InMemoryState::new(ACCOUNT_KEY_LEN);
    let mut chunked = engine(&chunked_state);
    let chunked_root = commit_chunked(&mut chunked, &chunked_state, &keys, &updates, 7)?;

    let expected = model.root();
    assert_eq!(batch_root, expected);
    assert_eq!(chunked_root, expected);

    // the second round runs on an engine restored from the first one's checkpoint
    let checkpoint = batch.encode_current_state(Vec::new())?;
    let mut restored = engine(&batch_state);
    restored.set_state(&checkpoint)?;
    assert_eq!(restored.root_hash(), expected);

    let (keys, updates) = next_round(&mut model, ACCOUNTS).build()?;
    let (batch_root, _) = commit_updates(&mut restored, &batch_state, &keys, &updates)?;
    let chunked_root = commit_chunked(&mut chunked, &chunked_state, &keys, &updates, 5)?;

    let expected = model.root();
    assert_ne!(expected, EMPTY_ROOT_HASH);
    assert_eq!(batch_root, expected);
    assert_eq!(chunked_root, expected);
    assert_eq!(batch_state.account_count(), model.accounts.len());
    Ok(())
}

#[test]
fn test_single_account_with_single_slot() -> Result<(), CommitmentError> {
    init_logger();
    let mut model = Model::default();
    let address = address(1);
    let account = Account { nonce: 1, balance: U256::from(10u64), ..Default::default() };
    let (location, value) = (location(1, 0), slot_value(1, 0, 0));
    model.accounts.insert(
        address.clone(),
        (account, BTreeMap::from([(location.clone(), value.clone())])),
    );

    let (keys, updates) = UpdateBuilder::new(ACCOUNT_KEY_LEN)
        .balance(&address, account.balance)
        .nonce(&address, account.nonce)
        .storage(&address, &location, &value)
        .build()?;
    let state = InMemoryState::new(ACCOUNT_KEY_LEN);
    let mut hph = engine(&state);
    let (root, _) = commit_updates(&mut hph, &state, &keys, &updates)?;
    assert_eq!(root, model.root());
    Ok(())
}

#[test]
fn test_delete_to_empty() -> Result<(), CommitmentError> {
    init_logger();
    let mut model = Model::default();
    let (keys, updates) = genesis(&mut model, 12).build()?;
    let state = InMemoryState::new(ACCOUNT_KEY_LEN);
    let mut hph = engine(&state);
    let (root, _) = commit_updates(&mut hph, &state, &keys, &updates)?;
    assert_eq!(root, model.root());

    let builder = keys.iter().fold(UpdateBuilder::new(ACCOUNT_KEY_LEN), |b, key| b.delete(key));
    let (keys, updates) = builder.build()?;
    let (root, _) = commit_updates(&mut hph, &state, &keys, &updates)?;
    assert_eq!(root, EMPTY_ROOT_HASH);
    assert_eq!(state.account_count(), 0);
    assert_eq!(state.storage_count(), 0);
    Ok(())
}
