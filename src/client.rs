use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    chain::ChainService,
    channel::{Exit, VirtualChannel},
    config::EngineConfig,
    engine::{
        Engine, EngineError, EngineEvent, PaymentRequest, PermissivePolicy, PolicyMaker,
        RejectAllPolicy, Request,
    },
    payments::Voucher,
    protocols::{
        directdefund, directfund, virtualdefund, virtualfund, ObjectiveId, ObjectiveRequest,
        ObjectiveStatus,
    },
    query::{self, LedgerChannelInfo, PaymentChannelInfo},
    sig::Signer,
    store::{Store, StoreError},
    types::{Address, Destination, U256},
    wire::MessageService,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("objective {0} failed")]
    ObjectiveFailed(ObjectiveId),
    #[error("channel {0} not found")]
    ChannelNotFound(Destination),
    #[error("engine stopped")]
    EngineStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
}

impl Outcome {
    fn of(status: ObjectiveStatus) -> Option<Self> {
        match status {
            ObjectiveStatus::Completed => Some(Outcome::Completed),
            ObjectiveStatus::Rejected => Some(Outcome::Failed),
            ObjectiveStatus::Unapproved | ObjectiveStatus::Approved => None,
        }
    }
}

/// Callers waiting for objectives to finish.
///
/// Nothing is kept once an objective has finished: late callers learn the
/// outcome from the store, which the engine updates before announcing it.
#[derive(Default)]
struct Waiters {
    waiting: HashMap<ObjectiveId, Vec<oneshot::Sender<Outcome>>>,
    closed: bool,
}

impl Waiters {
    /// `settled` is the outcome already recorded for `id`, if any.
    fn wait(&mut self, id: ObjectiveId, settled: Option<Outcome>) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        if let Some(outcome) = settled {
            let _ = tx.send(outcome);
        } else if !self.closed {
            self.waiting.entry(id).or_default().push(tx);
        }
        rx
    }

    fn finish(&mut self, id: &ObjectiveId, outcome: Outcome) {
        for tx in self.waiting.remove(id).unwrap_or_default() {
            let _ = tx.send(outcome);
        }
    }

    /// Wake everybody still waiting; their objectives will not finish.
    fn close(&mut self) {
        self.closed = true;
        self.waiting.clear();
    }
}

/// A running node: the engine, plus a dispatcher turning engine events into
/// completion notifications.
///
/// Every operation starting an objective returns as soon as the engine has
/// taken it on; use [NitroClient::objective_complete] to wait for the result.
pub struct NitroClient {
    me: Address,
    store: Arc<dyn Store>,
    requests: mpsc::Sender<Request>,
    payments: mpsc::Sender<PaymentRequest>,
    waiters: Arc<Mutex<Waiters>>,
    events: broadcast::Sender<EngineEvent>,
    token: CancellationToken,
    engine: JoinHandle<Result<(), EngineError>>,
    dispatcher: JoinHandle<()>,
}

impl NitroClient {
    /// Start a node, approving counterparty objectives if the config says so.
    pub fn new(
        signer: Signer,
        store: Arc<dyn Store>,
        msg: Arc<dyn MessageService>,
        chain: Arc<dyn ChainService>,
        config: EngineConfig,
    ) -> Result<Self, ClientError> {
        let policy: Box<dyn PolicyMaker> = if config.auto_approve {
            Box::new(PermissivePolicy)
        } else {
            Box::new(RejectAllPolicy)
        };
        Self::with_policy(signer, store, msg, chain, policy, config)
    }

    pub fn with_policy(
        signer: Signer,
        store: Arc<dyn Store>,
        msg: Arc<dyn MessageService>,
        chain: Arc<dyn ChainService>,
        policy: Box<dyn PolicyMaker>,
        config: EngineConfig,
    ) -> Result<Self, ClientError> {
        let me = signer.address();
        let (engine, handle) = Engine::new(signer, store.clone(), msg, chain, policy, config)?;
        let waiters = Arc::new(Mutex::new(Waiters::default()));
        let (events, _) = broadcast::channel(64);

        let dispatcher = tokio::spawn(dispatch(handle.events, waiters.clone(), events.clone()));
        let engine = tokio::spawn(engine.run());

        Ok(Self {
            me,
            store,
            requests: handle.requests,
            payments: handle.payments,
            waiters,
            events,
            token: handle.token,
            engine,
            dispatcher,
        })
    }

    pub fn address(&self) -> Address {
        self.me
    }

    /// Engine events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Open a ledger channel with `counterparty`, funded on chain.
    pub async fn create_ledger_channel(
        &self,
        counterparty: Address,
        challenge_duration: u32,
        outcome: Exit,
    ) -> Result<ObjectiveId, ClientError> {
        self.start(ObjectiveRequest::DirectFund(directfund::ObjectiveRequest {
            counterparty,
            challenge_duration,
            outcome,
            app_definition: Address::default(),
            app_data: Vec::new(),
            nonce: rand::random(),
        }))
        .await
    }

    pub async fn close_ledger_channel(&self, channel_id: Destination) -> Result<ObjectiveId, ClientError> {
        self.start(ObjectiveRequest::DirectDefund(directdefund::ObjectiveRequest {
            channel_id,
        }))
        .await
    }

    /// Open a payment channel to `counterparty` through `intermediaries`,
    /// funded by the ledger channels along the way.
    pub async fn create_payment_channel(
        &self,
        intermediaries: Vec<Address>,
        counterparty: Address,
        challenge_duration: u32,
        outcome: Exit,
    ) -> Result<ObjectiveId, ClientError> {
        self.start(ObjectiveRequest::VirtualFund(virtualfund::ObjectiveRequest {
            intermediaries,
            counterparty,
            challenge_duration,
            outcome,
            nonce: rand::random(),
            app_definition: Address::default(),
        }))
        .await
    }

    pub async fn close_payment_channel(&self, channel_id: Destination) -> Result<ObjectiveId, ClientError> {
        self.start(ObjectiveRequest::VirtualDefund(virtualdefund::ObjectiveRequest {
            channel_id,
        }))
        .await
    }

    /// Send a voucher paying `amount` more to the payee of the channel.
    pub async fn pay(&self, channel_id: Destination, amount: U256) -> Result<Voucher, ClientError> {
        let (done, rx) = oneshot::channel();
        self.payments
            .send(PaymentRequest {
                channel_id,
                amount,
                done,
            })
            .await
            .map_err(|_| ClientError::EngineStopped)?;
        Ok(rx.await.map_err(|_| ClientError::EngineStopped)??)
    }

    /// Wait until the objective completes. Objectives that already finished
    /// resolve immediately.
    pub async fn objective_complete(&self, id: &ObjectiveId) -> Result<(), ClientError> {
        let rx = {
            // Held across the lookup so a completion cannot slip in between.
            let mut waiters = self.waiters.lock();
            let settled = self
                .store
                .get_objective(id)
                .ok()
                .and_then(|o| Outcome::of(o.status()));
            waiters.wait(id.clone(), settled)
        };
        match rx.await {
            Ok(Outcome::Completed) => Ok(()),
            Ok(Outcome::Failed) => Err(ClientError::ObjectiveFailed(id.clone())),
            Err(_) => Err(ClientError::EngineStopped),
        }
    }

    pub fn get_ledger_channel(&self, id: &Destination) -> Result<LedgerChannelInfo, ClientError> {
        if let Ok(cc) = self.store.get_consensus_channel(id) {
            return Ok(query::ledger_info_from_consensus(&cc));
        }
        let c = self.store.get_channel(id)?;
        query::ledger_info_from_channel(&c).ok_or(ClientError::ChannelNotFound(*id))
    }

    pub fn get_payment_channel(&self, id: &Destination) -> Result<PaymentChannelInfo, ClientError> {
        let c = self.store.get_channel(id)?;
        let v = VirtualChannel::from_channel(c).map_err(|_| ClientError::ChannelNotFound(*id))?;
        let vouchers = self.store.get_voucher_info(id).ok();
        query::payment_info(&v, vouchers.as_ref()).ok_or(ClientError::ChannelNotFound(*id))
    }

    /// Stop the engine and wait for it to close its collaborators.
    pub async fn shutdown(self) -> Result<(), ClientError> {
        self.token.cancel();
        let result = self.engine.await.map_err(|_| ClientError::EngineStopped)?;
        if self.dispatcher.await.is_err() {
            tracing::warn!("event dispatcher panicked");
        }
        Ok(result?)
    }

    async fn start(&self, objective: ObjectiveRequest) -> Result<ObjectiveId, ClientError> {
        let (started, rx) = oneshot::channel();
        self.requests
            .send(Request { objective, started })
            .await
            .map_err(|_| ClientError::EngineStopped)?;
        Ok(rx.await.map_err(|_| ClientError::EngineStopped)??)
    }
}

async fn dispatch(
    mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    waiters: Arc<Mutex<Waiters>>,
    events: broadcast::Sender<EngineEvent>,
) {
    while let Some(event) = engine_events.recv().await {
        {
            let mut waiters = waiters.lock();
            for id in &event.completed_objectives {
                waiters.finish(id, Outcome::Completed);
            }
            for id in &event.failed_objectives {
                waiters.finish(id, Outcome::Failed);
            }
        }
        // No subscribers is fine.
        let _ = events.send(event);
    }
    waiters.lock().close();
}
