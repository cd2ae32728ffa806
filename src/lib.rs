//! Single-decree Paxos for a fixed panel of nine peers.
//!
//! Each participant process hosts the three classic roles behind one
//! [`Engine`]:
//!
//! - **Acceptor**: answers phase-1/phase-2 requests from its promise/accept
//!   record ([`core::acceptor`])
//! - **Proposer**: drives rounds — mints proposal numbers, collects quorums,
//!   retries on timeout with monotonic escalation ([`core::round`] plus the
//!   driver in [`engine`])
//! - **Learner**: records the first decision it observes and gossips it to
//!   stragglers
//!
//! Peers exchange newline-terminated `key=value` lines ([`codec`]) over
//! one-shot TCP connections ([`transport`]); every message is fire-and-forget
//! and loss is recovered by protocol timeouts, never by transport retries.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod config;
pub mod core;
pub mod engine;
pub mod messages;
pub mod profile;
pub mod transport;

pub use config::{MemberId, Membership, PeerAddr};
pub use engine::{Engine, Timing, Transport};
pub use messages::Message;
pub use profile::Profile;
pub use transport::{NetStack, TcpTransport, TokioNet, run_listener};
