//! Pure proposer round record — quorum bookkeeping for one proposal number.

use std::collections::{BTreeMap, BTreeSet};

use super::{PROPOSAL_STRIDE, ProposalNumber, QUORUM};
use crate::config::MemberId;

/// Bookkeeping for one proposer round at a fixed `n`, from prepare until
/// accept-quorum or abandonment. A retry installs a fresh record; the old one
/// is dropped, never merged, and stale timer callbacks detect the swap by
/// comparing `n`.
#[derive(Clone, Debug)]
pub struct Round {
    n: ProposalNumber,
    candidate: String,
    promises: BTreeSet<MemberId>,
    prior_accepts: BTreeMap<MemberId, (ProposalNumber, String)>,
    accepts: BTreeSet<MemberId>,
    highest_rejection: Option<ProposalNumber>,
    accept_requested: bool,
    decided: Option<String>,
}

impl Round {
    #[must_use]
    pub fn new(n: ProposalNumber, candidate: String) -> Self {
        Self {
            n,
            candidate,
            promises: BTreeSet::new(),
            prior_accepts: BTreeMap::new(),
            accepts: BTreeSet::new(),
            highest_rejection: None,
            accept_requested: false,
            decided: None,
        }
    }

    #[must_use]
    pub fn n(&self) -> ProposalNumber {
        self.n
    }

    /// The candidate this round is carrying. Rewritten at promise-quorum if
    /// any promise reported a prior accept.
    #[must_use]
    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    /// Record a promise from `from`, with the prior accept it reported.
    ///
    /// Returns the candidate to carry into phase 2 when this promise
    /// completes the quorum. The accept request must go out exactly once per
    /// round, so promises arriving after that return `None`.
    pub fn record_promise(
        &mut self,
        from: MemberId,
        prior: Option<(ProposalNumber, String)>,
    ) -> Option<&str> {
        self.promises.insert(from);
        if let Some(prior) = prior {
            self.prior_accepts.insert(from, prior);
        }
        if self.accept_requested || self.promises.len() < QUORUM {
            return None;
        }
        self.accept_requested = true;
        // Paxos value selection: a prior accept with the highest number wins
        // over the caller's candidate.
        if let Some((_, adopted)) = self.prior_accepts.values().max_by_key(|(n, _)| *n) {
            self.candidate = adopted.clone();
        }
        Some(&self.candidate)
    }

    /// Record an `accepted` observed for this round's `n`.
    ///
    /// Returns `true` when this acceptance completes the quorum on a round
    /// that had not decided yet.
    pub fn record_accepted(&mut self, from: MemberId, candidate: &str) -> bool {
        self.accepts.insert(from);
        if self.decided.is_some() || self.accepts.len() < QUORUM {
            return false;
        }
        self.decided = Some(candidate.to_owned());
        true
    }

    /// Record the `higherN` carried by a reject; consumed by the next retry.
    pub fn record_reject(&mut self, higher_n: ProposalNumber) {
        if higher_n >= 0 {
            self.highest_rejection = Some(self.highest_rejection.unwrap_or(-1).max(higher_n));
        }
    }

    #[must_use]
    pub fn promise_quorum(&self) -> bool {
        self.promises.len() >= QUORUM
    }

    #[must_use]
    pub fn accept_quorum(&self) -> bool {
        self.accepts.len() >= QUORUM
    }

    #[must_use]
    pub fn decided(&self) -> Option<&str> {
        self.decided.as_deref()
    }

    /// Counter floor for the retry after this round timed out: high enough to
    /// outrank every rejection seen, and at least one full stride past `n`.
    #[must_use]
    pub fn retry_counter_floor(&self) -> i64 {
        let outrank_rejections = self.highest_rejection.unwrap_or(-1) + 1;
        outrank_rejections.max(self.n + PROPOSAL_STRIDE) / PROPOSAL_STRIDE
    }
}
