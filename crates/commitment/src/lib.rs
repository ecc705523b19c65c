//! Incremental state commitment over a hex Patricia hashed trie.
//!
//! [`HexPatriciaHashed`] turns batches of account and storage updates into an Ethereum
//! compatible state root. Only the paths touched by a batch are rehashed; the rest of the trie is
//! read back from the branch nodes persisted by earlier passes, which the engine emits as
//! [`BranchUpdates`] for the caller to store.

mod branch;
pub use branch::*;

mod cell;
pub use cell::*;

mod error;
pub use error::*;

mod hp;
pub use hp::*;

mod hph;
pub use hph::*;

mod lookup;
pub use lookup::*;

mod mem_state;
pub use mem_state::*;

mod nibble_set;
pub use nibble_set::*;

mod rlp;

mod snapshot;
pub use snapshot::*;

mod update;
pub use update::*;
