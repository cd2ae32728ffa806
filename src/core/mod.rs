//! Pure protocol state machines — no I/O, no async, no synchronization.

pub mod acceptor;
pub mod round;

/// Fixed panel size; the wire protocol knows exactly the members `M1`..`M9`.
pub const MEMBERS: usize = 9;

/// Majority quorum over [`MEMBERS`].
pub const QUORUM: usize = MEMBERS / 2 + 1;

/// Proposal numbers are minted as `counter * PROPOSAL_STRIDE + member index`,
/// so two members can never mint the same number and the minting member is
/// recoverable from `n % PROPOSAL_STRIDE`.
pub const PROPOSAL_STRIDE: i64 = 100;

/// Totally ordered proposal number. Always `>= 1` once minted; absence is
/// modelled with `Option`, never a sentinel.
pub type ProposalNumber = i64;
