//! The consensus engine: one per process, hosting the acceptor, proposer,
//! and learner roles over shared state.
//!
//! Handlers compute their outbound messages under the owning lock and send
//! them after release, so no lock is ever held across I/O. Timer callbacks
//! re-look-up the round by the `n` they were armed for and fire inertly when
//! the round has been superseded or a decision exists.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::future;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, trace, warn};

use crate::config::MemberId;
use crate::core::acceptor::{AcceptOutcome, AcceptorState, PrepareOutcome};
use crate::core::round::Round;
use crate::core::{PROPOSAL_STRIDE, ProposalNumber};
use crate::messages::Message;

/// Abstract outbound path: deliver one message to one peer, best effort.
///
/// Implementations swallow transport failures; recovery comes from protocol
/// timeouts, never from error propagation.
pub trait Transport: Clone + Send + Sync + 'static {
    fn send(&self, to: MemberId, message: Message) -> impl Future<Output = ()> + Send;
}

/// Protocol timers. The defaults are the reference deployment's; simulations
/// keep them and let virtual time pay the bill.
#[derive(Clone, Debug)]
pub struct Timing {
    /// Phase-1 quorum deadline.
    pub prepare_timeout: Duration,
    /// Phase-2 quorum deadline.
    pub accept_timeout: Duration,
    /// Uniform retry jitter, milliseconds. Keeps two colliding proposers from
    /// lock-stepping each other forever.
    pub retry_jitter_ms: std::ops::Range<u64>,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_millis(2500),
            accept_timeout: Duration::from_millis(2500),
            retry_jitter_ms: 50..200,
        }
    }
}

struct ProposerState {
    /// Monotonic mint counter; `n = counter * 100 + member index`.
    counter: i64,
    /// At most one live round. Replaced wholesale on retry.
    round: Option<Round>,
    rng: StdRng,
}

struct Shared<T> {
    id: MemberId,
    peers: Vec<MemberId>,
    transport: T,
    timing: Timing,
    acceptor: Mutex<AcceptorState>,
    proposer: Mutex<ProposerState>,
    /// The learner's decision. Set exactly once; readable without a lock.
    decision: OnceLock<String>,
    /// Values already gossip-relayed, to suppress re-broadcast storms.
    relayed: Mutex<BTreeSet<String>>,
}

/// One participant's consensus engine. Cheap to clone; clones share state.
pub struct Engine<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Prepare,
    Accept,
}

impl<T: Transport> Engine<T> {
    #[must_use]
    pub fn new(id: MemberId, transport: T) -> Self {
        Self::with_config(id, transport, Timing::default(), rand::rng().random())
    }

    /// Fully parameterized constructor; the seed drives retry jitter, so a
    /// fixed seed reproduces a scheduler outcome.
    #[must_use]
    pub fn with_config(id: MemberId, transport: T, timing: Timing, seed: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                peers: MemberId::all().filter(|peer| *peer != id).collect(),
                transport,
                timing,
                acceptor: Mutex::new(AcceptorState::new()),
                proposer: Mutex::new(ProposerState {
                    counter: 0,
                    round: None,
                    rng: StdRng::seed_from_u64(seed),
                }),
                decision: OnceLock::new(),
                relayed: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> MemberId {
        self.shared.id
    }

    /// The decided value, once this participant has learned one.
    #[must_use]
    pub fn decision(&self) -> Option<&str> {
        self.shared.decision.get().map(String::as_str)
    }

    /// Install a pre-existing accept, as if phase 2 had completed before this
    /// process joined the conversation. Test and harness hook.
    pub fn seed_accepted(&self, n: ProposalNumber, candidate: &str) {
        *self.shared.acceptor.lock().unwrap() = AcceptorState::with_accepted(n, candidate);
    }

    /// Inbound demux: route one parsed message to the owning role.
    pub async fn deliver(&self, message: Message) {
        match message {
            Message::Propose { origin, candidate } => {
                info!(%origin, %candidate, "received propose trigger");
                self.propose(candidate).await;
            }
            Message::Prepare { from, n } => self.on_prepare(from, n).await,
            Message::Promise { from, n, prior } => self.on_promise(from, n, prior).await,
            Message::Reject { from, higher_n } => self.on_reject(from, higher_n),
            Message::AcceptRequest { from, n, candidate } => {
                self.on_accept_request(from, n, candidate).await;
            }
            Message::Accepted { from, n, candidate } => {
                self.on_accepted(from, n, &candidate).await;
            }
            Message::Decide { from, candidate } => self.on_decide(from, candidate).await,
        }
    }

    /// Start (or retry) a round proposing `candidate`: mint a fresh `n`,
    /// install a fresh round record, broadcast the prepare, arm the phase-1
    /// deadline.
    pub async fn propose(&self, candidate: String) {
        if let Some(decided) = self.shared.decision.get() {
            info!(%decided, "already decided, dropping propose");
            return;
        }
        let n = {
            let mut proposer = self.shared.proposer.lock().unwrap();
            proposer.counter += 1;
            let n = proposer.counter * PROPOSAL_STRIDE + self.shared.id.index();
            proposer.round = Some(Round::new(n, candidate));
            n
        };
        debug!(n, "starting round, broadcasting prepare");
        self.broadcast(Message::Prepare {
            from: self.shared.id,
            n,
        })
        .await;
        self.arm_timer(n, Phase::Prepare);
    }

    async fn on_prepare(&self, from: MemberId, n: ProposalNumber) {
        if let Some(decided) = self.shared.decision.get() {
            trace!(%from, "prepare after decision, replying decide");
            self.send(from, self.decide_message(decided)).await;
            return;
        }
        let reply = {
            let mut acceptor = self.shared.acceptor.lock().unwrap();
            match acceptor.on_prepare(n) {
                PrepareOutcome::Promised { prior } => {
                    debug!(%from, n, "promised");
                    Message::Promise {
                        from: self.shared.id,
                        n,
                        prior,
                    }
                }
                PrepareOutcome::Rejected { promised } => {
                    trace!(%from, n, promised, "rejecting prepare");
                    Message::Reject {
                        from: self.shared.id,
                        higher_n: promised,
                    }
                }
            }
        };
        self.send(from, reply).await;
    }

    async fn on_accept_request(&self, from: MemberId, n: ProposalNumber, candidate: String) {
        if let Some(decided) = self.shared.decision.get() {
            trace!(%from, "accept request after decision, replying decide");
            self.send(from, self.decide_message(decided)).await;
            return;
        }
        let outcome = self
            .shared
            .acceptor
            .lock()
            .unwrap()
            .on_accept_request(n, &candidate);
        match outcome {
            AcceptOutcome::Accepted => {
                debug!(%from, n, %candidate, "accepted");
                self.broadcast(Message::Accepted {
                    from: self.shared.id,
                    n,
                    candidate: candidate.clone(),
                })
                .await;
                // Broadcast excludes self, so our own acceptance must be
                // counted directly toward any round we are driving.
                self.on_accepted(self.shared.id, n, &candidate).await;
            }
            AcceptOutcome::Rejected { promised } => {
                trace!(%from, n, promised, "rejecting accept request");
                self.send(
                    from,
                    Message::Reject {
                        from: self.shared.id,
                        higher_n: promised,
                    },
                )
                .await;
            }
        }
    }

    async fn on_promise(
        &self,
        from: MemberId,
        n: ProposalNumber,
        prior: Option<(ProposalNumber, String)>,
    ) {
        let launch = {
            let mut proposer = self.shared.proposer.lock().unwrap();
            if self.shared.decision.get().is_some() {
                return;
            }
            let Some(round) = proposer.round.as_mut() else {
                trace!(%from, n, "promise with no active round");
                return;
            };
            if round.n() != n {
                trace!(%from, n, current = round.n(), "promise for a stale round");
                return;
            }
            round.record_promise(from, prior).map(str::to_owned)
        };
        if let Some(candidate) = launch {
            debug!(n, %candidate, "promise quorum reached, requesting accepts");
            self.broadcast(Message::AcceptRequest {
                from: self.shared.id,
                n,
                candidate,
            })
            .await;
            self.arm_timer(n, Phase::Accept);
        }
    }

    async fn on_accepted(&self, from: MemberId, n: ProposalNumber, candidate: &str) {
        let decided = {
            let mut proposer = self.shared.proposer.lock().unwrap();
            let Some(round) = proposer.round.as_mut() else {
                return;
            };
            if round.n() != n {
                trace!(%from, n, current = round.n(), "accepted for a stale round");
                return;
            }
            let newly_decided = round.record_accepted(from, candidate);
            if newly_decided {
                // Record the decision while the proposer lock still pins the
                // round that produced it.
                self.decide_local(candidate);
            }
            newly_decided
        };
        if decided {
            debug!(n, %candidate, "accept quorum reached, broadcasting decide");
            self.broadcast(Message::Decide {
                from: self.shared.id,
                candidate: candidate.to_owned(),
            })
            .await;
        }
    }

    fn on_reject(&self, from: MemberId, higher_n: ProposalNumber) {
        if higher_n < 0 {
            return;
        }
        let mut proposer = self.shared.proposer.lock().unwrap();
        if self.shared.decision.get().is_some() {
            return;
        }
        if let Some(round) = proposer.round.as_mut() {
            trace!(%from, higher_n, "recording rejection");
            round.record_reject(higher_n);
        }
    }

    async fn on_decide(&self, from: MemberId, candidate: String) {
        self.decide_local(&candidate);
        let first_relay = self.shared.relayed.lock().unwrap().insert(candidate.clone());
        debug!(%from, %candidate, "learned decision");
        if first_relay {
            self.broadcast(Message::Decide {
                from: self.shared.id,
                candidate,
            })
            .await;
        }
    }

    /// Record the decision. The first call emits the user-visible consensus
    /// line; later calls are no-ops. A conflicting value would contradict
    /// Paxos safety, so it is reported, never applied.
    fn decide_local(&self, candidate: &str) {
        match self.shared.decision.set(candidate.to_owned()) {
            Ok(()) => {
                info!(%candidate, "consensus reached");
                println!("CONSENSUS: {candidate}");
            }
            Err(conflicting) => {
                if self.shared.decision.get().is_some_and(|d| *d != conflicting) {
                    error!(%conflicting, "protocol violation: decide with a different value");
                }
            }
        }
    }

    fn decide_message(&self, decided: &str) -> Message {
        Message::Decide {
            from: self.shared.id,
            candidate: decided.to_owned(),
        }
    }

    fn arm_timer(&self, n: ProposalNumber, phase: Phase) {
        let deadline = match phase {
            Phase::Prepare => self.shared.timing.prepare_timeout,
            Phase::Accept => self.shared.timing.accept_timeout,
        };
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            engine.on_phase_deadline(n, phase).await;
        });
    }

    /// Phase deadline: if the round armed for is still current, undecided,
    /// and short of its quorum, bump the mint counter past every rejection
    /// seen and retry after jitter. Otherwise fire inertly.
    async fn on_phase_deadline(&self, n: ProposalNumber, phase: Phase) {
        let (candidate, delay) = {
            let mut proposer = self.shared.proposer.lock().unwrap();
            if self.shared.decision.get().is_some() {
                return;
            }
            let (floor, candidate) = {
                let Some(round) = proposer.round.as_ref() else {
                    return;
                };
                if round.n() != n {
                    trace!(n, current = round.n(), "stale timer, ignoring");
                    return;
                }
                let satisfied = match phase {
                    Phase::Prepare => round.promise_quorum(),
                    Phase::Accept => round.accept_quorum(),
                };
                if satisfied {
                    return;
                }
                (round.retry_counter_floor(), round.candidate().to_owned())
            };
            proposer.counter = proposer.counter.max(floor);
            let jitter = proposer
                .rng
                .random_range(self.shared.timing.retry_jitter_ms.clone());
            warn!(n, ?phase, jitter, "quorum deadline passed, will retry");
            (candidate, Duration::from_millis(jitter))
        };
        tokio::time::sleep(delay).await;
        self.propose(candidate).await;
    }

    async fn send(&self, to: MemberId, message: Message) {
        trace!(%to, kind = message.kind(), "sending");
        self.shared.transport.send(to, message).await;
    }

    /// Fan out to every peer. Broadcast never includes self.
    async fn broadcast(&self, message: Message) {
        debug!(kind = message.kind(), "broadcasting");
        future::join_all(
            self.shared
                .peers
                .iter()
                .map(|peer| self.shared.transport.send(*peer, message.clone())),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transport that records every send and delivers nothing.
    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<(MemberId, Message)>>>,
    }

    impl Transport for RecordingTransport {
        async fn send(&self, to: MemberId, message: Message) {
            self.sent.lock().unwrap().push((to, message));
        }
    }

    fn m(k: u8) -> MemberId {
        format!("M{k}").parse().unwrap()
    }

    fn engine() -> (Engine<RecordingTransport>, RecordingTransport) {
        let transport = RecordingTransport::default();
        let engine = Engine::with_config(m(1), transport.clone(), Timing::default(), 7);
        (engine, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn propose_broadcasts_prepare_to_the_other_eight() {
        let (engine, transport) = engine();
        engine.propose("M5".to_owned()).await;
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 8);
        assert!(sent.iter().all(|(to, message)| {
            *to != m(1) && matches!(message, Message::Prepare { n: 101, .. })
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn minted_numbers_are_strictly_increasing_and_tagged() {
        let (engine, transport) = engine();
        engine.propose("M5".to_owned()).await;
        engine.propose("M5".to_owned()).await;
        let sent = transport.sent.lock().unwrap();
        let ns: Vec<_> = sent
            .iter()
            .filter_map(|(_, message)| match message {
                Message::Prepare { n, .. } => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(ns.first(), Some(&101));
        assert!(ns.windows(2).all(|w| w[0] < w[1]));
        assert!(ns.iter().all(|n| n % PROPOSAL_STRIDE == 1));
        assert_eq!(ns.iter().collect::<BTreeSet<_>>().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn decide_is_recorded_once_and_gossiped_once() {
        let (engine, transport) = engine();
        engine
            .deliver(Message::Decide {
                from: m(2),
                candidate: "M5".to_owned(),
            })
            .await;
        engine
            .deliver(Message::Decide {
                from: m(3),
                candidate: "M5".to_owned(),
            })
            .await;
        assert_eq!(engine.decision(), Some("M5"));
        let sent = transport.sent.lock().unwrap();
        let relays = sent
            .iter()
            .filter(|(_, message)| matches!(message, Message::Decide { .. }))
            .count();
        // One gossip fan-out to eight peers, not two.
        assert_eq!(relays, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn conflicting_decide_does_not_overwrite() {
        let (engine, _transport) = engine();
        engine
            .deliver(Message::Decide {
                from: m(2),
                candidate: "M5".to_owned(),
            })
            .await;
        engine
            .deliver(Message::Decide {
                from: m(3),
                candidate: "M8".to_owned(),
            })
            .await;
        assert_eq!(engine.decision(), Some("M5"));
    }

    #[tokio::test(start_paused = true)]
    async fn propose_after_decision_is_dropped() {
        let (engine, transport) = engine();
        engine
            .deliver(Message::Decide {
                from: m(2),
                candidate: "M5".to_owned(),
            })
            .await;
        transport.sent.lock().unwrap().clear();
        engine
            .deliver(Message::Propose {
                origin: "script".to_owned(),
                candidate: "M1".to_owned(),
            })
            .await;
        assert!(
            transport
                .sent
                .lock()
                .unwrap()
                .iter()
                .all(|(_, message)| !matches!(message, Message::Prepare { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_after_decision_short_circuits_with_decide() {
        let (engine, transport) = engine();
        engine
            .deliver(Message::Decide {
                from: m(2),
                candidate: "M5".to_owned(),
            })
            .await;
        transport.sent.lock().unwrap().clear();
        engine.deliver(Message::Prepare { from: m(4), n: 901 }).await;
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            (to, Message::Decide { candidate, .. }) if *to == m(4) && candidate == "M5"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn value_selection_adopts_highest_prior_accept() {
        let (engine, transport) = engine();
        engine.propose("M7".to_owned()).await;
        transport.sent.lock().unwrap().clear();
        let priors: [Option<(ProposalNumber, String)>; 5] = [
            None,
            Some((103, "M3".to_owned())),
            None,
            Some((205, "M2".to_owned())),
            None,
        ];
        for (k, prior) in (2..=6).zip(priors) {
            engine
                .deliver(Message::Promise {
                    from: m(k),
                    n: 101,
                    prior,
                })
                .await;
        }
        let sent = transport.sent.lock().unwrap();
        let accept_requests: Vec<_> = sent
            .iter()
            .filter_map(|(_, message)| match message {
                Message::AcceptRequest { n, candidate, .. } => Some((*n, candidate.clone())),
                _ => None,
            })
            .collect();
        // Exactly one fan-out of eight, carrying the value accepted at 205.
        assert_eq!(accept_requests.len(), 8);
        assert!(
            accept_requests
                .iter()
                .all(|(n, candidate)| *n == 101 && candidate == "M2")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn four_promises_do_not_launch_phase_two() {
        let (engine, transport) = engine();
        engine.propose("M7".to_owned()).await;
        transport.sent.lock().unwrap().clear();
        for k in 2..=5 {
            engine
                .deliver(Message::Promise {
                    from: m(k),
                    n: 101,
                    prior: None,
                })
                .await;
        }
        assert!(
            transport
                .sent
                .lock()
                .unwrap()
                .iter()
                .all(|(_, message)| !matches!(message, Message::AcceptRequest { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_deadline_bumps_past_rejections_and_retries() {
        let (engine, transport) = engine();
        engine.propose("M7".to_owned()).await;
        engine
            .deliver(Message::Reject {
                from: m(9),
                higher_n: 1234,
            })
            .await;
        transport.sent.lock().unwrap().clear();
        // Past the 2.5 s deadline plus the widest jitter.
        tokio::time::sleep(Duration::from_millis(2800)).await;
        let sent = transport.sent.lock().unwrap();
        let retry_n = sent
            .iter()
            .find_map(|(_, message)| match message {
                Message::Prepare { n, .. } => Some(*n),
                _ => None,
            })
            .expect("deadline should have scheduled a retry");
        assert_eq!(retry_n, 1301);
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_deadline_fires_inertly() {
        let (engine, transport) = engine();
        engine.propose("M7".to_owned()).await;
        for k in 2..=6 {
            engine
                .deliver(Message::Promise {
                    from: m(k),
                    n: 101,
                    prior: None,
                })
                .await;
        }
        for k in 2..=6 {
            engine
                .deliver(Message::Accepted {
                    from: m(k),
                    n: 101,
                    candidate: "M7".to_owned(),
                })
                .await;
        }
        assert_eq!(engine.decision(), Some("M7"));
        transport.sent.lock().unwrap().clear();
        tokio::time::sleep(Duration::from_secs(10)).await;
        // No retries: both deadlines observed a settled round.
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn own_accept_counts_toward_quorum() {
        let (engine, transport) = engine();
        engine.propose("M7".to_owned()).await;
        for k in 2..=6 {
            engine
                .deliver(Message::Promise {
                    from: m(k),
                    n: 101,
                    prior: None,
                })
                .await;
        }
        // Our own acceptor accepts our accept-request; four peers follow.
        engine
            .deliver(Message::AcceptRequest {
                from: m(1),
                n: 101,
                candidate: "M7".to_owned(),
            })
            .await;
        for k in 2..=5 {
            engine
                .deliver(Message::Accepted {
                    from: m(k),
                    n: 101,
                    candidate: "M7".to_owned(),
                })
                .await;
        }
        assert_eq!(engine.decision(), Some("M7"));
        let sent = transport.sent.lock().unwrap();
        assert!(
            sent.iter()
                .any(|(_, message)| matches!(message, Message::Decide { .. }))
        );
    }
}
