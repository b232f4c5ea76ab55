//! The engine: the single writer to the store, driving every objective of a
//! node forward as requests, peer messages and chain events come in.

pub mod policy;

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, oneshot};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    chain::{ChainError, ChainEvent, ChainService},
    channel::{ChannelError, VirtualChannel},
    config::EngineConfig,
    consensus::{Proposal, SignedProposal},
    messages::{Message, ObjectivePayload},
    payments::{PaymentError, Voucher, VoucherManager},
    protocols::{
        DirectDefund, DirectFund, Objective, ObjectiveId, ObjectiveKind, ObjectiveRequest,
        ObjectiveStatus, ProtocolError, Related, SideEffects, VirtualDefund, VirtualFund,
        WaitingFor,
    },
    query::{self, ChannelStatus, LedgerChannelInfo, PaymentChannelInfo},
    sig::Signer,
    store::{Store, StoreError},
    types::{Address, Destination, U256},
    wire::{MessageService, WireError},
};

pub use policy::{PermissivePolicy, PolicyMaker, RejectAllPolicy};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("chain event feed closed")]
    ChainFeedClosed,
    #[error("outbound message queue closed")]
    OutboundClosed,
    #[error("ledger proposal loop closed")]
    LoopbackClosed,
}

impl EngineError {
    /// Errors caused by races between peers, which the engine logs and
    /// carries on from.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            EngineError::Store(StoreError::ObjectiveNotFound(_))
                | EngineError::Store(StoreError::VoucherInfoNotFound(_))
                | EngineError::Payment(PaymentError::Store(StoreError::VoucherInfoNotFound(_)))
                | EngineError::Protocol(ProtocolError::LedgerChannelExists(_))
                | EngineError::Protocol(ProtocolError::NotApproved)
        )
    }
}

/// A locally requested objective. `started` is answered once the objective
/// has been stored and cranked for the first time.
#[derive(Debug)]
pub struct Request {
    pub objective: ObjectiveRequest,
    pub started: oneshot::Sender<Result<ObjectiveId, EngineError>>,
}

#[derive(Debug)]
pub struct PaymentRequest {
    pub channel_id: Destination,
    pub amount: U256,
    pub done: oneshot::Sender<Result<Voucher, EngineError>>,
}

/// What changed during one engine step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineEvent {
    pub completed_objectives: Vec<ObjectiveId>,
    pub failed_objectives: Vec<ObjectiveId>,
    pub received_vouchers: Vec<Voucher>,
    pub ledger_channel_updates: Vec<LedgerChannelInfo>,
    pub payment_channel_updates: Vec<PaymentChannelInfo>,
}

impl EngineEvent {
    pub fn merge(&mut self, other: EngineEvent) {
        self.completed_objectives.extend(other.completed_objectives);
        self.failed_objectives.extend(other.failed_objectives);
        self.received_vouchers.extend(other.received_vouchers);
        self.ledger_channel_updates
            .extend(other.ledger_channel_updates);
        self.payment_channel_updates
            .extend(other.payment_channel_updates);
    }

    pub fn is_empty(&self) -> bool {
        self.completed_objectives.is_empty()
            && self.failed_objectives.is_empty()
            && self.received_vouchers.is_empty()
            && self.ledger_channel_updates.is_empty()
            && self.payment_channel_updates.is_empty()
    }
}

/// The caller's side of an [Engine].
pub struct EngineHandle {
    pub requests: mpsc::Sender<Request>,
    pub payments: mpsc::Sender<PaymentRequest>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub token: CancellationToken,
}

pub struct Engine {
    me: Address,
    signer: Signer,
    store: Arc<dyn Store>,
    msg: Arc<dyn MessageService>,
    chain: Arc<dyn ChainService>,
    policy: Box<dyn PolicyMaker>,
    vm: VoucherManager,
    config: EngineConfig,

    inbound: mpsc::Receiver<Message>,
    chain_events: mpsc::UnboundedReceiver<ChainEvent>,
    requests: mpsc::Receiver<Request>,
    payments: mpsc::Receiver<PaymentRequest>,
    loopback_tx: mpsc::UnboundedSender<Proposal>,
    loopback_rx: mpsc::UnboundedReceiver<Proposal>,
    events: mpsc::UnboundedSender<EngineEvent>,
    outbound: Option<mpsc::UnboundedSender<Message>>,

    tracker: TaskTracker,
    token: CancellationToken,
    resubscribed: bool,

    last_ledger_info: Reported<LedgerChannelInfo>,
    last_payment_info: Reported<PaymentChannelInfo>,
}

impl Engine {
    /// Build an engine. Inputs are taken from the collaborators right away so
    /// nothing that happens before [Engine::run] is missed.
    pub fn new(
        signer: Signer,
        store: Arc<dyn Store>,
        msg: Arc<dyn MessageService>,
        chain: Arc<dyn ChainService>,
        policy: Box<dyn PolicyMaker>,
        config: EngineConfig,
    ) -> Result<(Self, EngineHandle), EngineError> {
        let me = signer.address();
        let inbound = msg.inbound()?;
        let chain_events = chain.event_feed()?;
        let (requests_tx, requests) = mpsc::channel(config.request_buffer.max(1));
        let (payments_tx, payments) = mpsc::channel(config.request_buffer.max(1));
        let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let engine = Self {
            me,
            signer,
            vm: VoucherManager::new(me, store.clone()),
            store,
            msg,
            chain,
            policy,
            config,
            inbound,
            chain_events,
            requests,
            payments,
            loopback_tx,
            loopback_rx,
            events,
            outbound: None,
            tracker: TaskTracker::new(),
            token: token.clone(),
            resubscribed: false,
            last_ledger_info: Reported::default(),
            last_payment_info: Reported::default(),
        };
        let handle = EngineHandle {
            requests: requests_tx,
            payments: payments_tx,
            events: events_rx,
            token,
        };
        Ok((engine, handle))
    }

    pub fn address(&self) -> Address {
        self.me
    }

    /// Run until the token is cancelled or a fatal error occurs, then close
    /// the collaborators.
    pub async fn run(mut self) -> Result<(), EngineError> {
        let span = tracing::info_span!("engine", node = %self.me);
        async move {
            let result = self.run_loop().await;
            self.shutdown().await;
            result
        }
        .instrument(span)
        .await
    }

    async fn run_loop(&mut self) -> Result<(), EngineError> {
        let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
        let msg = self.msg.clone();
        self.tracker.spawn(
            async move {
                while let Some(m) = queue.recv().await {
                    let to = m.to;
                    if let Err(e) = msg.send(m).await {
                        tracing::warn!(peer = %to, error = %e, "failed to send message");
                    }
                }
            }
            .in_current_span(),
        );
        self.outbound = Some(outbound);

        let mut poll = tokio::time::interval(self.config.block_poll_interval());
        tracing::info!("engine started");
        loop {
            let step = tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                Some(req) = self.requests.recv() => self.handle_request(req).await,
                Some(req) = self.payments.recv() => self.handle_payment(req),
                event = self.chain_events.recv() => match event {
                    Some(event) => self.handle_chain_event(event).await,
                    None => self.resubscribe(),
                },
                Some(m) = self.inbound.recv() => self.handle_message(m).await,
                Some(p) = self.loopback_rx.recv() => self.handle_proposal(p).await,
                _ = poll.tick() => self.poll_block_num().await,
            };

            match step {
                Ok(event) => self.emit(event),
                Err(e) if e.is_benign() => {
                    tracing::warn!(error = %e, "ignoring error");
                }
                Err(e) => {
                    tracing::error!(error = %e, "engine failed");
                    self.token.cancel();
                    return Err(e);
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        self.outbound = None;
        self.tracker.close();
        self.tracker.wait().await;

        if let Err(e) = self.msg.close().await {
            tracing::warn!(error = %e, "closing message service");
        }
        if let Err(e) = self.chain.close().await {
            tracing::warn!(error = %e, "closing chain service");
        }
        if let Err(e) = self.store.close() {
            tracing::warn!(error = %e, "closing store");
        }
        tracing::info!("engine stopped");
    }

    fn emit(&self, event: EngineEvent) {
        if !event.is_empty() {
            // Nobody listening is fine.
            let _ = self.events.send(event);
        }
    }

    fn resubscribe(&mut self) -> Result<EngineEvent, EngineError> {
        if self.resubscribed {
            return Err(EngineError::ChainFeedClosed);
        }
        tracing::warn!("chain event feed closed, resubscribing");
        self.resubscribed = true;
        self.chain_events = self.chain.event_feed()?;
        Ok(EngineEvent::default())
    }

    async fn poll_block_num(&mut self) -> Result<EngineEvent, EngineError> {
        let block_num = self.chain.last_confirmed_block_num().await?;
        self.store.set_last_block_num_seen(block_num)?;
        Ok(EngineEvent::default())
    }

    async fn handle_request(&mut self, req: Request) -> Result<EngineEvent, EngineError> {
        let Request { objective, started } = req;
        let id = objective.id(self.me);
        tracing::info!(objective = %id, "objective requested");

        let objective = match self.objective_from_request(&objective) {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(objective = %id, error = %e, "could not start objective");
                let _ = started.send(Err(e));
                return Ok(EngineEvent::default());
            }
        };
        let result = self.attempt_progress(objective).await;
        let _ = started.send(Ok(id));
        result
    }

    fn objective_from_request(&self, request: &ObjectiveRequest) -> Result<Objective, EngineError> {
        let store = self.store.as_ref();
        let objective = match request {
            ObjectiveRequest::DirectFund(r) => {
                Objective::DirectFund(DirectFund::new(r, true, self.me, store)?)
            }
            ObjectiveRequest::DirectDefund(r) => {
                Objective::DirectDefund(DirectDefund::new(r, true, store)?)
            }
            ObjectiveRequest::VirtualFund(r) => {
                Objective::VirtualFund(VirtualFund::new(r, true, self.me, store)?)
            }
            ObjectiveRequest::VirtualDefund(r) => {
                let paid = self.paid_on(&r.channel_id)?;
                Objective::VirtualDefund(VirtualDefund::new(r, true, self.me, paid, store)?)
            }
        };
        self.adopt(&objective)?;
        Ok(objective)
    }

    fn objective_from_payload(&self, payload: &ObjectivePayload) -> Result<Objective, EngineError> {
        let store = self.store.as_ref();
        Ok(match payload.objective_id.kind() {
            ObjectiveKind::DirectFund => {
                Objective::DirectFund(DirectFund::from_payload(payload, self.me, store)?)
            }
            ObjectiveKind::DirectDefund => {
                Objective::DirectDefund(DirectDefund::from_payload(payload, store)?)
            }
            ObjectiveKind::VirtualFund => {
                Objective::VirtualFund(VirtualFund::from_payload(payload, self.me, store)?)
            }
            ObjectiveKind::VirtualDefund => {
                let paid = self.paid_on(&payload.objective_id.channel_id())?;
                Objective::VirtualDefund(VirtualDefund::from_payload(
                    payload, self.me, paid, store,
                )?)
            }
        })
    }

    /// Take over what a newly accepted objective needs: a ledger being
    /// closed leaves the consensus protocol, the ends of a payment channel
    /// start tracking vouchers.
    fn adopt(&self, objective: &Objective) -> Result<(), EngineError> {
        match objective {
            Objective::DirectDefund(o) => self.store.destroy_consensus_channel(&o.c.id),
            Objective::VirtualFund(o) if o.is_payer() || o.is_payee() => {
                let v = &o.v;
                let amount = v.payer_initial_amount().map_err(ProtocolError::from)?;
                self.vm.register(v.id(), v.payer(), v.payee(), amount)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn paid_on(&self, channel_id: &Destination) -> Result<U256, EngineError> {
        match self.vm.paid(channel_id) {
            Ok(paid) => Ok(paid),
            Err(PaymentError::Store(StoreError::VoucherInfoNotFound(_))) => Ok(U256::zero()),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_message(&mut self, m: Message) -> Result<EngineEvent, EngineError> {
        tracing::debug!(from = %m.from, "received message");
        let mut event = EngineEvent::default();

        for payload in &m.objective_payloads {
            let step = self.handle_payload(payload).await;
            event.merge(tolerate(step)?);
        }
        for sp in m.ledger_proposals {
            let step = self.handle_signed_proposal(sp).await;
            event.merge(tolerate(step)?);
        }
        for id in &m.rejected_objectives {
            let step = self.handle_rejection(id);
            event.merge(tolerate(step)?);
        }
        for voucher in m.payments {
            let step = self.handle_voucher(voucher);
            event.merge(tolerate(step)?);
        }
        Ok(event)
    }

    async fn handle_payload(&mut self, payload: &ObjectivePayload) -> Result<EngineEvent, EngineError> {
        let id = &payload.objective_id;
        let objective = match self.store.get_objective(id) {
            Ok(o) => o,
            Err(StoreError::ObjectiveNotFound(_)) => {
                let o = self.objective_from_payload(payload)?;
                if !self.policy.should_approve(&o) {
                    let (rejected, side_effects) = o.reject(self.me);
                    self.store.set_objective(&rejected)?;
                    self.execute_side_effects(side_effects).await?;
                    return Ok(EngineEvent {
                        failed_objectives: vec![id.clone()],
                        ..Default::default()
                    });
                }
                self.adopt(&o)?;
                tracing::info!(objective = %id, "joined objective");
                o.approve()
            }
            Err(e) => return Err(e.into()),
        };

        if objective.is_finished() {
            tracing::debug!(objective = %id, "payload for finished objective");
            return Ok(EngineEvent::default());
        }
        let updated = objective.update(payload)?;
        self.attempt_progress(updated).await
    }

    async fn handle_signed_proposal(&mut self, sp: SignedProposal) -> Result<EngineEvent, EngineError> {
        let id = ObjectiveId::for_proposal(&sp.proposal);
        tracing::debug!(objective = %id, turn = sp.turn_num, "received ledger proposal");
        let objective = match self.store.get_objective(&id) {
            Ok(o) => o,
            Err(e @ StoreError::ObjectiveNotFound(_)) => {
                // Later proposals on this ledger will be out of turn.
                tracing::warn!(
                    objective = %id,
                    ledger = %sp.proposal.ledger_id,
                    turn = sp.turn_num,
                    "dropping ledger proposal for unknown objective"
                );
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        if objective.is_finished() {
            return Ok(EngineEvent::default());
        }

        let updated = objective.receive_proposal(sp)?;
        if updated.status() != ObjectiveStatus::Approved {
            self.store.set_objective(&updated)?;
            return Ok(EngineEvent::default());
        }
        self.attempt_progress(updated).await
    }

    fn handle_rejection(&mut self, id: &ObjectiveId) -> Result<EngineEvent, EngineError> {
        let objective = self.store.get_objective(id)?;
        if objective.is_finished() {
            return Ok(EngineEvent::default());
        }
        tracing::info!(objective = %id, "objective rejected by peer");
        let rejected = objective.rejected_by_peer();
        self.store.set_objective(&rejected)?;
        self.store
            .release_channel_from_ownership(&rejected.owns_channel());
        Ok(EngineEvent {
            failed_objectives: vec![id.clone()],
            ..Default::default()
        })
    }

    fn handle_voucher(&mut self, voucher: Voucher) -> Result<EngineEvent, EngineError> {
        let channel_id = voucher.channel_id;
        let total = self.vm.receive(voucher.clone())?;
        tracing::debug!(channel = %channel_id, total = %total, "received voucher");

        let mut event = EngineEvent {
            received_vouchers: vec![voucher],
            ..Default::default()
        };
        if let Some(info) = self.payment_channel_info(&channel_id) {
            self.push_payment_update(&mut event, info);
        }
        Ok(event)
    }

    async fn handle_proposal(&mut self, p: Proposal) -> Result<EngineEvent, EngineError> {
        let id = ObjectiveId::for_proposal(&p);
        let objective = self.store.get_objective(&id)?;
        if objective.is_finished() {
            return Ok(EngineEvent::default());
        }
        self.attempt_progress(objective).await
    }

    async fn handle_chain_event(&mut self, event: ChainEvent) -> Result<EngineEvent, EngineError> {
        let channel_id = event.channel_id();
        tracing::debug!(channel = %channel_id, block = event.block_num(), "chain event");
        self.store.set_last_block_num_seen(event.block_num())?;

        if let Some(objective) = self.store.get_objective_by_channel_id(&channel_id) {
            let updated = objective.update_with_chain_event(&event)?;
            return self.attempt_progress(updated).await;
        }

        match self.store.get_channel(&channel_id) {
            Ok(mut c) => match c.update_with_chain_event(&event) {
                Ok(()) => self.store.set_channel(c)?,
                Err(ChannelError::StaleChainEvent { .. }) => {}
                Err(e) => return Err(ProtocolError::from(e).into()),
            },
            Err(StoreError::ChannelNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(EngineEvent::default())
    }

    fn handle_payment(&mut self, req: PaymentRequest) -> Result<EngineEvent, EngineError> {
        let PaymentRequest {
            channel_id,
            amount,
            done,
        } = req;
        match self.pay(channel_id, amount) {
            Ok((voucher, event)) => {
                let _ = done.send(Ok(voucher));
                Ok(event)
            }
            Err(e) => {
                tracing::warn!(channel = %channel_id, error = %e, "payment failed");
                let _ = done.send(Err(e));
                Ok(EngineEvent::default())
            }
        }
    }

    fn pay(&mut self, channel_id: Destination, amount: U256) -> Result<(Voucher, EngineEvent), EngineError> {
        let voucher = self.vm.pay(channel_id, amount, &self.signer)?;
        let payee = self.vm.voucher_info(&channel_id)?.payee;
        self.send(Message::voucher(self.me, payee, voucher.clone()))?;

        let mut event = EngineEvent::default();
        if let Some(info) = self.payment_channel_info(&channel_id) {
            self.push_payment_update(&mut event, info);
        }
        Ok((voucher, event))
    }

    /// Crank the objective, persist the result and carry out its side
    /// effects.
    async fn attempt_progress(&mut self, objective: Objective) -> Result<EngineEvent, EngineError> {
        let id = objective.id();
        let was_finished = objective.is_finished();
        let (cranked, side_effects, waiting_for) = objective.crank(&self.signer)?;
        self.store.set_objective(&cranked)?;
        tracing::debug!(objective = %id, waiting_for = %waiting_for, "cranked objective");

        let mut event = self.notifications(&cranked);
        if waiting_for == WaitingFor::Nothing && !was_finished {
            self.store
                .release_channel_from_ownership(&cranked.owns_channel());
            if let Objective::DirectFund(o) = &cranked {
                let ledger = o.create_consensus_channel()?;
                self.push_ledger_update(&mut event, query::ledger_info_from_consensus(&ledger));
                self.store.set_consensus_channel(ledger)?;
                self.store.destroy_channel(&o.c.id);
            }
            tracing::info!(objective = %id, "objective completed");
            event.completed_objectives.push(id);
        }

        self.execute_side_effects(side_effects).await?;
        Ok(event)
    }

    async fn execute_side_effects(&mut self, side_effects: SideEffects) -> Result<(), EngineError> {
        for m in side_effects.messages_to_send {
            self.send(m)?;
        }
        for tx in side_effects.transactions_to_submit {
            tracing::info!(channel = %tx.channel_id(), "submitting transaction");
            self.chain.send_transaction(tx).await?;
        }
        for p in side_effects.proposals_to_process {
            self.loopback_tx
                .send(p)
                .map_err(|_| EngineError::LoopbackClosed)?;
        }
        Ok(())
    }

    fn send(&self, m: Message) -> Result<(), EngineError> {
        self.outbound
            .as_ref()
            .ok_or(EngineError::OutboundClosed)?
            .send(m)
            .map_err(|_| EngineError::OutboundClosed)
    }

    /// Channel summaries of the objective's related entities that changed
    /// since they were last reported.
    fn notifications(&mut self, objective: &Objective) -> EngineEvent {
        let mut event = EngineEvent::default();
        let is_virtual = matches!(
            objective,
            Objective::VirtualFund(_) | Objective::VirtualDefund(_)
        );
        for related in objective.related() {
            match related {
                Related::Channel(c) if is_virtual => {
                    let Ok(v) = VirtualChannel::from_channel(c) else {
                        continue;
                    };
                    let vouchers = self.vm.voucher_info(&v.id()).ok();
                    if let Some(info) = query::payment_info(&v, vouchers.as_ref()) {
                        self.push_payment_update(&mut event, info);
                    }
                }
                Related::Channel(c) => {
                    if let Some(info) = query::ledger_info_from_channel(&c) {
                        self.push_ledger_update(&mut event, info);
                    }
                }
                Related::Consensus(cc) => {
                    self.push_ledger_update(&mut event, query::ledger_info_from_consensus(&cc));
                }
            }
        }
        event
    }

    fn payment_channel_info(&self, channel_id: &Destination) -> Option<PaymentChannelInfo> {
        let c = self.store.get_channel(channel_id).ok()?;
        let v = VirtualChannel::from_channel(c).ok()?;
        let vouchers = self.vm.voucher_info(channel_id).ok();
        query::payment_info(&v, vouchers.as_ref())
    }

    fn push_ledger_update(&mut self, event: &mut EngineEvent, info: LedgerChannelInfo) {
        let complete = info.status == ChannelStatus::Complete;
        if self.last_ledger_info.changed(info.id, &info, complete) {
            event.ledger_channel_updates.push(info);
        }
    }

    fn push_payment_update(&mut self, event: &mut EngineEvent, info: PaymentChannelInfo) {
        let complete = info.status == ChannelStatus::Complete;
        if self.last_payment_info.changed(info.id, &info, complete) {
            event.payment_channel_updates.push(info);
        }
    }
}

/// The summary last reported for each channel. Complete channels are
/// forgotten.
struct Reported<T> {
    last: HashMap<Destination, T>,
}

impl<T> Default for Reported<T> {
    fn default() -> Self {
        Self {
            last: HashMap::new(),
        }
    }
}

impl<T: Clone + PartialEq> Reported<T> {
    /// Whether `info` differs from what was last reported for `id`.
    fn changed(&mut self, id: Destination, info: &T, complete: bool) -> bool {
        if complete {
            return self.last.remove(&id).as_ref() != Some(info);
        }
        if self.last.get(&id) == Some(info) {
            return false;
        }
        self.last.insert(id, info.clone());
        true
    }
}

/// Drop benign errors of a single message item so the rest of the message
/// is still handled.
fn tolerate(step: Result<EngineEvent, EngineError>) -> Result<EngineEvent, EngineError> {
    match step {
        Err(e) if e.is_benign() => {
            tracing::warn!(error = %e, "ignoring message item");
            Ok(EngineEvent::default())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{SimulatedChain, SimulatedChainService},
        channel::state::tests::signers,
        consensus::{tests::ledger_pair, Add, Guarantee},
        store::MemStore,
        wire::{Broker, MemMessageService},
    };
    use rand::{rngs::StdRng, SeedableRng};

    fn idle_engine() -> Engine {
        let signer = Signer::new(&mut StdRng::seed_from_u64(7));
        let me = signer.address();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let msg = Arc::new(MemMessageService::new(Broker::new(), me, 8));
        let chain = Arc::new(SimulatedChainService::new(SimulatedChain::new(1.into(), 0, 8)));
        let (engine, _handle) = Engine::new(
            signer,
            store,
            msg,
            chain,
            Box::new(PermissivePolicy),
            EngineConfig::default(),
        )
        .unwrap();
        engine
    }

    #[tokio::test]
    async fn proposal_without_objective_is_dropped() {
        let mut engine = idle_engine();
        let (a, b) = signers();
        let (mut leader, _) = ledger_pair(&a, &b, 5, 5);
        let g = Guarantee::new(
            2.into(),
            Destination([4; 32]),
            leader.leader().into(),
            leader.follower().into(),
        );
        let sp = leader
            .propose(Proposal::add(leader.id, Add::new(g, 1.into())), &a)
            .unwrap();

        let err = engine.handle_signed_proposal(sp).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Store(StoreError::ObjectiveNotFound(_))
        ));
        assert!(tolerate(Err(err)).unwrap().is_empty());
    }

    #[test]
    fn complete_channels_are_forgotten() {
        let mut reported = Reported::default();
        let id = Destination([5; 32]);

        assert!(reported.changed(id, &1u32, false));
        assert!(!reported.changed(id, &1, false));
        assert!(reported.changed(id, &2, false));
        assert!(reported.changed(id, &3, true));
        assert!(reported.last.is_empty());

        // Unchanged on completion: nothing new to report, still forgotten.
        assert!(reported.changed(id, &4, false));
        assert!(!reported.changed(id, &4, true));
        assert!(reported.last.is_empty());
    }

    #[test]
    fn benign_errors() {
        let id = ObjectiveId::new(ObjectiveKind::DirectFund, Destination([1; 32]));
        assert!(EngineError::from(StoreError::ObjectiveNotFound(id)).is_benign());
        assert!(EngineError::from(ProtocolError::NotApproved).is_benign());
        assert!(EngineError::from(PaymentError::Store(StoreError::VoucherInfoNotFound(
            Destination([1; 32])
        )))
        .is_benign());

        assert!(!EngineError::from(StoreError::Closed).is_benign());
        assert!(!EngineError::ChainFeedClosed.is_benign());
        assert!(!EngineError::from(ProtocolError::UnexpectedState(3)).is_benign());
    }

    #[test]
    fn merged_events() {
        let mut event = EngineEvent::default();
        assert!(event.is_empty());
        event.merge(EngineEvent {
            completed_objectives: vec![ObjectiveId::new(
                ObjectiveKind::VirtualFund,
                Destination([2; 32]),
            )],
            ..Default::default()
        });
        assert!(!event.is_empty());
        assert_eq!(event.completed_objectives.len(), 1);
    }
}
