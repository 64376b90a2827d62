use std::collections::VecDeque;
use std::fmt;

use tracing::{debug, info, warn};

use super::link::{LinkState, PeerLink};
use crate::signaling::{IceCandidate, Role, SessionDescription, SignalMessage};

/// Remote candidates that arrived before the remote description
pub type CandidateBuffer = VecDeque<IceCandidate>;

/// Where one call attempt stands.
///
/// The candidate buffer only exists in the states before a remote
/// description has been applied, and `ready` is only accepted in
/// `AwaitingRole`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    Idle,
    /// Joined, room not paired yet
    AwaitingRole { pending: CandidateBuffer },
    /// Caller: offer sent, waiting for the answer
    Offering { pending: CandidateBuffer },
    /// Callee: waiting for the caller's offer
    AwaitingOffer { pending: CandidateBuffer },
    /// Both descriptions in place, connectivity checks running
    DescriptionExchanged { role: Role },
    Connected { role: Role },
    /// Link lost connectivity after connecting; may still recover
    PeerDisconnected { role: Role },
    Failed,
    /// Signaling channel gone
    Disconnected,
}

impl NegotiationState {
    pub fn name(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::AwaitingRole { .. } => "awaiting-role",
            NegotiationState::Offering { .. } => "initiator-offering",
            NegotiationState::AwaitingOffer { .. } => "responder-waiting",
            NegotiationState::DescriptionExchanged { .. } => "description-exchanged",
            NegotiationState::Connected { .. } => "connected",
            NegotiationState::PeerDisconnected { .. } => "peer-disconnected",
            NegotiationState::Failed => "failed",
            NegotiationState::Disconnected => "disconnected",
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            NegotiationState::Offering { .. } => Some(Role::Caller),
            NegotiationState::AwaitingOffer { .. } => Some(Role::Callee),
            NegotiationState::DescriptionExchanged { role }
            | NegotiationState::Connected { role }
            | NegotiationState::PeerDisconnected { role } => Some(*role),
            _ => None,
        }
    }

    pub fn remote_description_applied(&self) -> bool {
        matches!(
            self,
            NegotiationState::DescriptionExchanged { .. }
                | NegotiationState::Connected { .. }
                | NegotiationState::PeerDisconnected { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationState::Failed | NegotiationState::Disconnected
        )
    }

    pub fn pending_candidates(&self) -> Option<&CandidateBuffer> {
        match self {
            NegotiationState::AwaitingRole { pending }
            | NegotiationState::Offering { pending }
            | NegotiationState::AwaitingOffer { pending } => Some(pending),
            _ => None,
        }
    }

    fn pending_mut(&mut self) -> Option<&mut CandidateBuffer> {
        match self {
            NegotiationState::AwaitingRole { pending }
            | NegotiationState::Offering { pending }
            | NegotiationState::AwaitingOffer { pending } => Some(pending),
            _ => None,
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Client-side handshake for one call attempt.
///
/// Every handler takes the link it drives and returns the message to send
/// back over the signaling channel, if any. Handlers must be called one at a
/// time, in the order messages arrive.
#[derive(Debug, Default)]
pub struct NegotiationSession {
    state: NegotiationState,
}

impl NegotiationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    /// Join sent; wait for the room to pair
    pub fn start(&mut self) {
        if self.state != NegotiationState::Idle {
            debug!("start() ignored in state {}", self.state);
            return;
        }
        self.state = NegotiationState::AwaitingRole {
            pending: CandidateBuffer::new(),
        };
    }

    pub async fn on_ready<L: PeerLink>(&mut self, role: Role, link: &mut L) -> Option<SignalMessage> {
        if !matches!(self.state, NegotiationState::AwaitingRole { .. }) {
            debug!("Ignoring ready in state {}", self.state);
            return None;
        }

        let pending = self.take_pending();
        info!("Assigned role {}", role);

        match role {
            Role::Callee => {
                self.state = NegotiationState::AwaitingOffer { pending };
                None
            }
            Role::Caller => {
                self.state = NegotiationState::Offering { pending };
                match create_local(link, Role::Caller).await {
                    Ok(offer) => Some(SignalMessage::Offer { offer }),
                    Err(e) => {
                        warn!("Error creating offer: {}", e);
                        self.state = NegotiationState::Failed;
                        None
                    }
                }
            }
        }
    }

    pub async fn on_offer<L: PeerLink>(
        &mut self,
        offer: SessionDescription,
        link: &mut L,
    ) -> Option<SignalMessage> {
        if !matches!(
            self.state,
            NegotiationState::AwaitingOffer { .. } | NegotiationState::AwaitingRole { .. }
        ) {
            debug!("Ignoring offer in state {}", self.state);
            return None;
        }

        if let Err(e) = link.set_remote_description(offer).await {
            warn!("Error applying remote offer: {}", e);
            return None;
        }

        let pending = self.take_pending();
        self.state = NegotiationState::DescriptionExchanged { role: Role::Callee };
        drain_candidates(link, pending).await;

        match create_local(link, Role::Callee).await {
            Ok(answer) => Some(SignalMessage::Answer { answer }),
            Err(e) => {
                warn!("Error creating answer: {}", e);
                self.state = NegotiationState::Failed;
                None
            }
        }
    }

    pub async fn on_answer<L: PeerLink>(&mut self, answer: SessionDescription, link: &mut L) {
        if !matches!(self.state, NegotiationState::Offering { .. }) {
            debug!("Ignoring answer in state {}", self.state);
            return;
        }

        if let Err(e) = link.set_remote_description(answer).await {
            warn!("Error applying remote answer: {}", e);
            return;
        }

        let pending = self.take_pending();
        self.state = NegotiationState::DescriptionExchanged { role: Role::Caller };
        drain_candidates(link, pending).await;
    }

    /// A remote candidate relayed by the server
    pub async fn on_candidate<L: PeerLink>(&mut self, candidate: Option<IceCandidate>, link: &mut L) {
        let Some(candidate) = candidate.filter(|c| !c.is_end_of_candidates()) else {
            debug!("End of remote candidates");
            return;
        };

        if let Some(pending) = self.state.pending_mut() {
            pending.push_back(candidate);
            debug!("Buffered remote candidate ({} pending)", pending.len());
            return;
        }

        if self.state.remote_description_applied() {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                warn!("Error adding ICE candidate: {}", e);
            }
        } else {
            debug!("Dropping remote candidate in state {}", self.state);
        }
    }

    /// Candidate gathered by the local link, to be sent to the peer
    pub fn on_local_candidate(&self, candidate: Option<IceCandidate>) -> Option<SignalMessage> {
        let candidate = candidate.filter(|c| !c.is_end_of_candidates())?;
        if self.state == NegotiationState::Idle || self.state.is_terminal() {
            return None;
        }
        Some(SignalMessage::Candidate {
            candidate: Some(candidate),
        })
    }

    /// Follow the media link. A link disconnect is transient: the link may
    /// reconnect on its own, and only `Failed` from the link ends the attempt.
    pub fn on_link_state(&mut self, link_state: LinkState) {
        if self.state == NegotiationState::Idle || self.state.is_terminal() {
            return;
        }

        let role = self.state.role();
        match (link_state, role) {
            (LinkState::Connected, Some(role)) if self.state.remote_description_applied() => {
                self.state = NegotiationState::Connected { role };
            }
            (LinkState::Disconnected, Some(role)) if self.state.remote_description_applied() => {
                info!("Link disconnected, waiting for it to recover");
                self.state = NegotiationState::PeerDisconnected { role };
            }
            (LinkState::Failed, _) => {
                self.state = NegotiationState::Failed;
            }
            (other, _) => debug!("Link state {:?} in state {}", other, self.state),
        }
    }

    /// The server refused the join (room full or already joined)
    pub fn on_join_rejected(&mut self) {
        if self.state != NegotiationState::Idle {
            self.state = NegotiationState::Failed;
        }
    }

    pub fn on_channel_lost(&mut self) {
        if self.state != NegotiationState::Idle {
            self.state = NegotiationState::Disconnected;
        }
    }

    /// Release local media and the link, then return to `Idle`.
    /// Valid in every state.
    pub fn end<L: PeerLink>(&mut self, link: &mut L) {
        link.stop_local_media();
        link.close();
        self.state = NegotiationState::Idle;
    }

    fn take_pending(&mut self) -> CandidateBuffer {
        self.state.pending_mut().map(std::mem::take).unwrap_or_default()
    }
}

/// Create the local offer or answer and install it as local description
async fn create_local<L: PeerLink>(
    link: &mut L,
    role: Role,
) -> Result<SessionDescription, super::link::PeerLinkError> {
    let desc = match role {
        Role::Caller => link.create_offer().await?,
        Role::Callee => link.create_answer().await?,
    };
    link.set_local_description(desc.clone()).await?;
    Ok(desc)
}

/// Apply buffered candidates in arrival order; one failure does not stop the rest
async fn drain_candidates<L: PeerLink>(link: &mut L, pending: CandidateBuffer) {
    if !pending.is_empty() {
        debug!("Applying {} buffered candidates", pending.len());
    }
    for candidate in pending {
        if let Err(e) = link.add_ice_candidate(candidate).await {
            warn!("Error adding buffered ICE candidate: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::link::PeerLinkError;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        CreateOffer,
        CreateAnswer,
        SetLocal(SessionDescription),
        SetRemote(SessionDescription),
        AddCandidate(String),
        StopMedia,
        Close,
    }

    #[derive(Default)]
    struct MockLink {
        ops: Vec<Op>,
        reject_candidates: Vec<String>,
        reject_remote: bool,
        fail_offer: bool,
    }

    impl MockLink {
        fn candidates(&self) -> Vec<String> {
            self.ops
                .iter()
                .filter_map(|op| match op {
                    Op::AddCandidate(c) => Some(c.clone()),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, wanted: &Op) -> usize {
            self.ops.iter().filter(|op| *op == wanted).count()
        }
    }

    impl PeerLink for MockLink {
        async fn start_local_media(&mut self) -> Result<(), PeerLinkError> {
            Ok(())
        }

        async fn create_offer(&mut self) -> Result<SessionDescription, PeerLinkError> {
            self.ops.push(Op::CreateOffer);
            if self.fail_offer {
                return Err(PeerLinkError::Description("no transceivers".into()));
            }
            Ok(SessionDescription::offer("local-offer"))
        }

        async fn create_answer(&mut self) -> Result<SessionDescription, PeerLinkError> {
            self.ops.push(Op::CreateAnswer);
            Ok(SessionDescription::answer("local-answer"))
        }

        async fn set_local_description(
            &mut self,
            desc: SessionDescription,
        ) -> Result<(), PeerLinkError> {
            self.ops.push(Op::SetLocal(desc));
            Ok(())
        }

        async fn set_remote_description(
            &mut self,
            desc: SessionDescription,
        ) -> Result<(), PeerLinkError> {
            if self.reject_remote {
                return Err(PeerLinkError::Description("bad sdp".into()));
            }
            self.ops.push(Op::SetRemote(desc));
            Ok(())
        }

        async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerLinkError> {
            self.ops.push(Op::AddCandidate(candidate.candidate.clone()));
            if self.reject_candidates.contains(&candidate.candidate) {
                return Err(PeerLinkError::Candidate(candidate.candidate));
            }
            Ok(())
        }

        fn stop_local_media(&mut self) {
            self.ops.push(Op::StopMedia);
        }

        fn close(&mut self) {
            self.ops.push(Op::Close);
        }
    }

    fn cand(s: &str) -> Option<IceCandidate> {
        Some(IceCandidate::new(s))
    }

    fn started() -> NegotiationSession {
        let mut session = NegotiationSession::new();
        session.start();
        session
    }

    #[tokio::test]
    async fn caller_sends_offer_on_ready() {
        let mut link = MockLink::default();
        let mut session = started();

        let out = session.on_ready(Role::Caller, &mut link).await;

        assert_eq!(
            out,
            Some(SignalMessage::Offer {
                offer: SessionDescription::offer("local-offer")
            })
        );
        assert_eq!(
            link.ops,
            vec![
                Op::CreateOffer,
                Op::SetLocal(SessionDescription::offer("local-offer"))
            ]
        );
        assert_eq!(session.state().name(), "initiator-offering");
        assert_eq!(session.state().role(), Some(Role::Caller));
    }

    #[tokio::test]
    async fn callee_waits_on_ready() {
        let mut link = MockLink::default();
        let mut session = started();

        assert_eq!(session.on_ready(Role::Callee, &mut link).await, None);

        assert!(link.ops.is_empty());
        assert_eq!(session.state().name(), "responder-waiting");
    }

    #[tokio::test]
    async fn duplicate_ready_does_not_create_second_offer() {
        let mut link = MockLink::default();
        let mut session = started();

        assert!(session.on_ready(Role::Caller, &mut link).await.is_some());
        assert!(session.on_ready(Role::Caller, &mut link).await.is_none());
        assert!(session.on_ready(Role::Callee, &mut link).await.is_none());

        assert_eq!(link.count(&Op::CreateOffer), 1);
        assert_eq!(session.state().role(), Some(Role::Caller));
    }

    #[tokio::test]
    async fn ready_before_start_is_ignored() {
        let mut link = MockLink::default();
        let mut session = NegotiationSession::new();

        assert!(session.on_ready(Role::Caller, &mut link).await.is_none());
        assert_eq!(*session.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn callee_buffers_candidates_until_offer_then_answers() {
        let mut link = MockLink::default();
        let mut session = started();
        session.on_ready(Role::Callee, &mut link).await;

        session.on_candidate(cand("c1"), &mut link).await;
        session.on_candidate(cand("c2"), &mut link).await;
        session.on_candidate(cand("c3"), &mut link).await;
        assert!(link.candidates().is_empty());
        assert_eq!(session.state().pending_candidates().map(|p| p.len()), Some(3));

        let out = session
            .on_offer(SessionDescription::offer("remote-offer"), &mut link)
            .await;

        assert_eq!(
            out,
            Some(SignalMessage::Answer {
                answer: SessionDescription::answer("local-answer")
            })
        );
        assert_eq!(
            link.ops,
            vec![
                Op::SetRemote(SessionDescription::offer("remote-offer")),
                Op::AddCandidate("c1".into()),
                Op::AddCandidate("c2".into()),
                Op::AddCandidate("c3".into()),
                Op::CreateAnswer,
                Op::SetLocal(SessionDescription::answer("local-answer")),
            ]
        );
        assert!(session.state().remote_description_applied());
    }

    #[tokio::test]
    async fn candidates_before_ready_are_kept() {
        let mut link = MockLink::default();
        let mut session = started();

        session.on_candidate(cand("early"), &mut link).await;
        session.on_ready(Role::Callee, &mut link).await;
        session.on_candidate(cand("later"), &mut link).await;
        session
            .on_offer(SessionDescription::offer("o"), &mut link)
            .await;

        assert_eq!(link.candidates(), vec!["early", "later"]);
    }

    #[tokio::test]
    async fn failing_candidate_does_not_stop_draining() {
        let mut link = MockLink {
            reject_candidates: vec!["bad".into()],
            ..Default::default()
        };
        let mut session = started();
        session.on_ready(Role::Caller, &mut link).await;

        for c in ["a", "bad", "b"] {
            session.on_candidate(cand(c), &mut link).await;
        }
        session
            .on_answer(SessionDescription::answer("remote-answer"), &mut link)
            .await;

        assert_eq!(link.candidates(), vec!["a", "bad", "b"]);
        assert_eq!(
            *session.state(),
            NegotiationState::DescriptionExchanged { role: Role::Caller }
        );
    }

    #[tokio::test]
    async fn candidates_after_description_apply_immediately() {
        let mut link = MockLink::default();
        let mut session = started();
        session.on_ready(Role::Caller, &mut link).await;
        session
            .on_answer(SessionDescription::answer("a"), &mut link)
            .await;

        session.on_candidate(cand("now"), &mut link).await;

        assert_eq!(link.candidates(), vec!["now"]);
    }

    #[tokio::test]
    async fn end_of_candidates_is_noop() {
        let mut link = MockLink::default();
        let mut session = started();
        session.on_ready(Role::Callee, &mut link).await;

        session.on_candidate(None, &mut link).await;
        session.on_candidate(cand(""), &mut link).await;

        assert_eq!(session.state().pending_candidates().map(|p| p.len()), Some(0));
    }

    #[tokio::test]
    async fn answer_only_meaningful_for_caller() {
        let mut link = MockLink::default();
        let mut session = started();
        session.on_ready(Role::Callee, &mut link).await;

        session
            .on_answer(SessionDescription::answer("stray"), &mut link)
            .await;

        assert!(link.ops.is_empty());
        assert_eq!(session.state().name(), "responder-waiting");
    }

    #[tokio::test]
    async fn offer_ignored_by_caller() {
        let mut link = MockLink::default();
        let mut session = started();
        session.on_ready(Role::Caller, &mut link).await;
        let ops_before = link.ops.len();

        let out = session
            .on_offer(SessionDescription::offer("glare"), &mut link)
            .await;

        assert!(out.is_none());
        assert_eq!(link.ops.len(), ops_before);
    }

    #[tokio::test]
    async fn rejected_remote_description_keeps_buffer_and_state() {
        let mut link = MockLink {
            reject_remote: true,
            ..Default::default()
        };
        let mut session = started();
        session.on_ready(Role::Callee, &mut link).await;
        session.on_candidate(cand("c1"), &mut link).await;

        let out = session
            .on_offer(SessionDescription::offer("broken"), &mut link)
            .await;

        assert!(out.is_none());
        assert_eq!(session.state().name(), "responder-waiting");
        assert_eq!(session.state().pending_candidates().map(|p| p.len()), Some(1));

        link.reject_remote = false;
        let out = session
            .on_offer(SessionDescription::offer("fixed"), &mut link)
            .await;
        assert!(out.is_some());
        assert_eq!(link.candidates(), vec!["c1"]);
    }

    #[tokio::test]
    async fn offer_creation_failure_fails_attempt() {
        let mut link = MockLink {
            fail_offer: true,
            ..Default::default()
        };
        let mut session = started();

        assert!(session.on_ready(Role::Caller, &mut link).await.is_none());
        assert_eq!(*session.state(), NegotiationState::Failed);
        assert!(session.on_ready(Role::Caller, &mut link).await.is_none());
        assert_eq!(link.count(&Op::CreateOffer), 1);
    }

    #[tokio::test]
    async fn link_states_drive_terminal_transitions() {
        let mut link = MockLink::default();
        let mut session = started();
        session.on_ready(Role::Caller, &mut link).await;
        session
            .on_answer(SessionDescription::answer("a"), &mut link)
            .await;

        session.on_link_state(LinkState::Checking);
        assert_eq!(session.state().name(), "description-exchanged");

        session.on_link_state(LinkState::Connected);
        assert_eq!(
            *session.state(),
            NegotiationState::Connected { role: Role::Caller }
        );

        session.on_link_state(LinkState::Failed);
        assert_eq!(*session.state(), NegotiationState::Failed);

        // nothing revives a failed attempt
        session.on_link_state(LinkState::Connected);
        assert_eq!(*session.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn link_disconnect_can_recover() {
        let mut link = MockLink::default();
        let mut session = started();
        session.on_ready(Role::Callee, &mut link).await;
        session
            .on_offer(SessionDescription::offer("o"), &mut link)
            .await;
        session.on_link_state(LinkState::Connected);

        session.on_link_state(LinkState::Disconnected);
        assert_eq!(
            *session.state(),
            NegotiationState::PeerDisconnected { role: Role::Callee }
        );
        assert!(!session.state().is_terminal());

        // trickled candidates keep flowing both ways while the link is down
        session.on_candidate(cand("late"), &mut link).await;
        assert_eq!(link.candidates(), vec!["late"]);
        assert!(session.on_local_candidate(cand("mine")).is_some());

        session.on_link_state(LinkState::Connected);
        assert_eq!(
            *session.state(),
            NegotiationState::Connected { role: Role::Callee }
        );
    }

    #[tokio::test]
    async fn link_disconnect_before_descriptions_is_ignored() {
        let mut link = MockLink::default();
        let mut session = started();
        session.on_ready(Role::Caller, &mut link).await;

        session.on_link_state(LinkState::Disconnected);
        assert_eq!(session.state().name(), "initiator-offering");
        assert_eq!(session.state().pending_candidates().map(|p| p.len()), Some(0));
    }

    #[test]
    fn local_candidates_are_sent_only_while_active() {
        let mut session = NegotiationSession::new();
        assert!(session.on_local_candidate(cand("x")).is_none());

        session.start();
        assert_eq!(
            session.on_local_candidate(cand("x")),
            Some(SignalMessage::Candidate {
                candidate: cand("x")
            })
        );
        assert!(session.on_local_candidate(None).is_none());

        session.on_channel_lost();
        assert!(session.on_local_candidate(cand("x")).is_none());
    }

    #[tokio::test]
    async fn end_releases_everything_from_any_state() {
        let mut link = MockLink::default();
        let mut session = started();
        session.on_ready(Role::Callee, &mut link).await;
        session.on_candidate(cand("c"), &mut link).await;

        session.end(&mut link);

        assert_eq!(*session.state(), NegotiationState::Idle);
        assert_eq!(link.ops, vec![Op::StopMedia, Op::Close]);

        // a fresh attempt starts clean
        session.start();
        assert_eq!(session.state().pending_candidates().map(|p| p.len()), Some(0));

        let mut idle = NegotiationSession::new();
        idle.end(&mut link);
        assert_eq!(*idle.state(), NegotiationState::Idle);
    }

    #[test]
    fn join_rejection_and_channel_loss_are_terminal() {
        let mut session = started();
        session.on_join_rejected();
        assert!(session.state().is_terminal());

        let mut session = started();
        session.on_channel_lost();
        assert_eq!(*session.state(), NegotiationState::Disconnected);

        // a link that comes back cannot undo a lost channel
        session.on_link_state(LinkState::Connected);
        assert_eq!(*session.state(), NegotiationState::Disconnected);
    }
}
