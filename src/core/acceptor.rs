//! Pure acceptor state machine — no I/O, no async, no synchronization.

use super::ProposalNumber;

/// Outcome of a phase-1 prepare.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// The acceptor promised `n`; carries its prior accept, if any, so the
    /// proposer can apply the value-selection rule at quorum.
    Promised {
        prior: Option<(ProposalNumber, String)>,
    },
    /// An equal-or-higher promise already outranks `n`.
    Rejected { promised: ProposalNumber },
}

/// Outcome of a phase-2 accept request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted,
    /// A strictly higher promise outranks `n`.
    Rejected { promised: ProposalNumber },
}

/// One participant's acceptor record: the highest promise made and the
/// highest accept taken. Created at process start, never reset.
///
/// Invariant: an accepted number never exceeds the promised number, and a
/// value is held exactly when an accept was taken.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AcceptorState {
    promised: Option<ProposalNumber>,
    accepted: Option<(ProposalNumber, String)>,
}

impl AcceptorState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State that already holds an accept, as if a phase 2 completed before
    /// this process joined the conversation.
    #[must_use]
    pub fn with_accepted(n: ProposalNumber, candidate: impl Into<String>) -> Self {
        Self {
            promised: Some(n),
            accepted: Some((n, candidate.into())),
        }
    }

    /// Phase 1: promise `n` unless an equal-or-higher promise exists.
    pub fn on_prepare(&mut self, n: ProposalNumber) -> PrepareOutcome {
        match self.promised {
            Some(promised) if n <= promised => PrepareOutcome::Rejected { promised },
            _ => {
                self.promised = Some(n);
                PrepareOutcome::Promised {
                    prior: self.accepted.clone(),
                }
            }
        }
    }

    /// Phase 2: bind `candidate` to `n` unless a strictly higher promise
    /// exists. `n` equal to the current promise is accepted, so the proposer
    /// that was promised exactly `n` can complete its round.
    pub fn on_accept_request(&mut self, n: ProposalNumber, candidate: &str) -> AcceptOutcome {
        match self.promised {
            Some(promised) if n < promised => AcceptOutcome::Rejected { promised },
            _ => {
                self.promised = Some(n);
                self.accepted = Some((n, candidate.to_owned()));
                AcceptOutcome::Accepted
            }
        }
    }

    #[must_use]
    pub fn promised(&self) -> Option<ProposalNumber> {
        self.promised
    }

    #[must_use]
    pub fn accepted(&self) -> Option<&(ProposalNumber, String)> {
        self.accepted.as_ref()
    }
}
