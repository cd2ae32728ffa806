//! Typed protocol messages — one arm per wire type, each carrying exactly its
//! required fields. The line format lives in [`crate::codec`].

use crate::config::MemberId;
use crate::core::ProposalNumber;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// External trigger to start proposing `candidate`. `origin` is free-form
    /// (the reference driver sends `script`) and is never replied to.
    Propose { origin: String, candidate: String },
    /// Phase 1 broadcast from a proposer.
    Prepare { from: MemberId, n: ProposalNumber },
    /// Phase 1 acceptor reply; carries the acceptor's prior accept when one
    /// exists.
    Promise {
        from: MemberId,
        n: ProposalNumber,
        prior: Option<(ProposalNumber, String)>,
    },
    /// The acceptor's current promise at `higher_n` outranks the request.
    Reject {
        from: MemberId,
        higher_n: ProposalNumber,
    },
    /// Phase 2 broadcast from a proposer.
    AcceptRequest {
        from: MemberId,
        n: ProposalNumber,
        candidate: String,
    },
    /// Phase 2 confirmation, broadcast by the accepting member to everyone.
    Accepted {
        from: MemberId,
        n: ProposalNumber,
        candidate: String,
    },
    /// Decision announcement, sent on accept-quorum and gossiped by learners.
    Decide { from: MemberId, candidate: String },
}

impl Message {
    /// The wire tag of this arm.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Propose { .. } => "PROPOSE",
            Message::Prepare { .. } => "PREPARE",
            Message::Promise { .. } => "PROMISE",
            Message::Reject { .. } => "REJECT",
            Message::AcceptRequest { .. } => "ACCEPT_REQUEST",
            Message::Accepted { .. } => "ACCEPTED",
            Message::Decide { .. } => "DECIDE",
        }
    }
}
