//! Cardano escrow watcher
//!
//! Follows the chain through Ogmios chain-sync and infers escrow events from transactions
//! touching watched script addresses. Classification is heuristic: outputs paying a script
//! are entries, spends of tracked outputs are releases unless a decodable spend redeemer
//! says otherwise.

use super::provider::{ChainSyncClient, ChainSyncConnector, OgmiosConnector};
use super::{
    start_watcher, stop_watcher, ChainWatcher, ConnectionStatus, EscrowContract, ReconnectPolicy,
    SessionEnd, SyncDriver, WatcherCore,
};
use crate::config::CardanoConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::cardano::{
    classify_output, classify_spend, Block, IntersectionResponse, NextBlockResponse, OutputRef,
    Point, Transaction, TxOutput,
};
use crate::events::{
    Chain, ChainPosition, EscrowEvent, EscrowEventKind, EventPayload, WatcherNotification,
};
use crate::state::EscrowState;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use ethers::types::U256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Watches escrow script addresses on a Cardano chain
pub struct CardanoWatcher<C: ChainSyncConnector = OgmiosConnector> {
    core: Arc<WatcherCore>,
    driver: Arc<CardanoDriver<C>>,
    policy: ReconnectPolicy,
}

impl CardanoWatcher<OgmiosConnector> {
    pub fn from_config(config: &CardanoConfig, policy: ReconnectPolicy) -> Self {
        let watcher = Self::new(
            OgmiosConnector::new(config.ogmios_url.clone()),
            config.start_point.clone(),
            policy,
        );
        for contract in &config.contracts {
            watcher.add_contract(contract.clone());
        }
        watcher
    }
}

impl<C: ChainSyncConnector> CardanoWatcher<C> {
    /// `start_point` is where chain-sync begins before any block was applied
    pub fn new(connector: C, start_point: Option<Point>, policy: ReconnectPolicy) -> Self {
        let core = Arc::new(WatcherCore::new(Chain::Cardano));
        let driver = Arc::new(CardanoDriver {
            connector,
            core: core.clone(),
            start_point,
            tracked: DashMap::new(),
        });
        Self {
            core,
            driver,
            policy,
        }
    }

    #[cfg(test)]
    fn tracked_outputs(&self) -> usize {
        self.driver.tracked.len()
    }
}

#[async_trait]
impl<C: ChainSyncConnector> ChainWatcher for CardanoWatcher<C> {
    fn chain(&self) -> Chain {
        Chain::Cardano
    }

    async fn start(&self) -> RelayerResult<()> {
        start_watcher(self.driver.clone(), self.core.clone(), self.policy.clone()).await
    }

    async fn stop(&self) {
        stop_watcher(&self.core).await
    }

    fn add_contract(&self, contract: EscrowContract) {
        self.core.insert_contract(contract);
    }

    fn remove_contract(&self, reference: &str) -> Option<EscrowContract> {
        let removed = self.core.delete_contract(reference)?;
        self.driver
            .tracked
            .retain(|_, output| output.contract_ref != reference);
        Some(removed)
    }

    async fn escrow_state(&self, contract_ref: &str, escrow_id: &str) -> Option<EscrowState> {
        self.core.escrow_state(contract_ref, escrow_id).await
    }

    async fn all_escrow_states(&self) -> Vec<EscrowState> {
        self.core.all_escrow_states().await
    }

    async fn connection_status(&self) -> ConnectionStatus {
        self.core.connection_status().await
    }

    fn subscribe(&self) -> broadcast::Receiver<WatcherNotification> {
        self.core.subscribe()
    }
}

/// An escrow output waiting to be spent
#[derive(Debug, Clone)]
struct TrackedOutput {
    contract_ref: String,
    escrow_id: String,
    amount: U256,
    asset: Option<String>,
}

struct CardanoDriver<C: ChainSyncConnector> {
    connector: C,
    core: Arc<WatcherCore>,
    start_point: Option<Point>,
    tracked: DashMap<OutputRef, TrackedOutput>,
}

struct CardanoSession<Cl> {
    client: Cl,
    /// The first roll-backward after an intersection only confirms it
    intersection: Point,
}

#[async_trait]
impl<C: ChainSyncConnector> SyncDriver for CardanoDriver<C> {
    type Session = CardanoSession<C::Client>;

    async fn connect(&self) -> RelayerResult<Self::Session> {
        let mut client = self.connector.connect().await?;

        let mut points = Vec::new();
        if let Some(ChainPosition::Slot { slot, id }) = self.core.last_position().await {
            points.push(Point::Specific { slot, id });
        }
        if let Some(start) = &self.start_point {
            points.push(start.clone());
        }
        if points.is_empty() {
            points.push(Point::Origin);
        }

        match client.find_intersection(points.clone()).await? {
            IntersectionResponse::Found(intersection) => {
                info!("Cardano chain-sync intersected at {}", intersection);
                Ok(CardanoSession {
                    client,
                    intersection,
                })
            }
            IntersectionResponse::NotFound => {
                warn!("No intersection among {:?}", points);
                Err(RelayerError::IntersectionNotFound {
                    chain: Chain::Cardano,
                })
            }
        }
    }

    async fn run_session(&self, session: Self::Session) -> SessionEnd {
        let CardanoSession {
            mut client,
            intersection,
        } = session;
        let mut confirming = Some(intersection);

        loop {
            match client.next_block().await {
                Ok(NextBlockResponse::RollForward { block }) => {
                    confirming = None;
                    self.apply_block(&block).await;
                }
                Ok(NextBlockResponse::RollBackward { point }) => {
                    if confirming.take().as_ref() == Some(&point) {
                        debug!("Chain-sync confirmed intersection {}", point);
                    } else {
                        self.roll_backward(point).await;
                    }
                }
                Err(RelayerError::Decode(e)) => {
                    warn!("Dropping undecodable chain-sync message: {}", e);
                    crate::metrics::record_decode_error(Chain::Cardano);
                }
                Err(e) => return SessionEnd::Failed(e),
            }
        }
    }
}

impl<C: ChainSyncConnector> CardanoDriver<C> {
    async fn apply_block(&self, block: &Block) {
        let contracts: HashMap<String, EscrowContract> = self
            .core
            .active_contracts()
            .into_iter()
            .map(|c| (c.reference.clone(), c))
            .collect();

        let mut events = Vec::new();
        for tx in &block.transactions {
            self.scan_transaction(block, tx, &contracts, &mut events);
        }

        for mut event in events {
            if event.payload.buyer.is_none() {
                event.payload.buyer = self
                    .core
                    .escrow_state(&event.contract_ref, &event.escrow_id)
                    .await
                    .map(|s| s.buyer)
                    .filter(|b| !b.is_empty());
            }
            self.core.ingest(event).await;
        }

        self.core
            .set_position(ChainPosition::Slot {
                slot: block.slot,
                id: block.id.clone(),
            })
            .await;
    }

    /// Spends of tracked outputs first, then new outputs paying watched scripts
    fn scan_transaction(
        &self,
        block: &Block,
        tx: &Transaction,
        contracts: &HashMap<String, EscrowContract>,
        events: &mut Vec<EscrowEvent>,
    ) {
        let counterparty = tx
            .outputs
            .iter()
            .find(|o| !contracts.contains_key(&o.address))
            .map(|o| o.address.clone());

        // Escrows whose output this transaction consumes, by contract
        let mut continuing: HashMap<String, String> = HashMap::new();

        for input in &tx.inputs {
            let Some((_, spent)) = self.tracked.remove(&OutputRef::from(input)) else {
                continue;
            };
            if !contracts.contains_key(&spent.contract_ref) {
                debug!(
                    "Dropping spend of {}#{} at inactive contract {}",
                    input.transaction.id, input.index, spent.contract_ref
                );
                continue;
            }
            let kind = classify_spend(tx, input);
            let seller = (kind == EscrowEventKind::Released)
                .then(|| counterparty.clone())
                .flatten();

            events.push(self.event(
                block,
                tx,
                kind,
                &spent.contract_ref,
                &spent.escrow_id,
                EventPayload {
                    buyer: None,
                    seller,
                    amount: spent.amount,
                    asset: spent.asset.clone(),
                },
            ));
            continuing.insert(spent.contract_ref, spent.escrow_id);
        }

        for (index, output) in tx.outputs.iter().enumerate() {
            let Some(contract) = contracts.get(&output.address) else {
                continue;
            };
            let Some((amount, asset)) = escrow_amount(output, contract) else {
                debug!(
                    "Output {}#{} lacks policy {:?}, skipping",
                    tx.id, index, contract.asset_policy
                );
                continue;
            };

            let output_ref = OutputRef {
                tx_id: tx.id.clone(),
                index: index as u32,
            };

            // A continuing output carries the escrow it was spent from
            if let Some(escrow_id) = continuing.get(&contract.reference) {
                self.tracked.insert(
                    output_ref,
                    TrackedOutput {
                        contract_ref: contract.reference.clone(),
                        escrow_id: escrow_id.clone(),
                        amount,
                        asset,
                    },
                );
                continue;
            }

            self.tracked.insert(
                output_ref,
                TrackedOutput {
                    contract_ref: contract.reference.clone(),
                    escrow_id: tx.id.clone(),
                    amount,
                    asset: asset.clone(),
                },
            );
            events.push(self.event(
                block,
                tx,
                classify_output(output),
                &contract.reference,
                &tx.id,
                EventPayload {
                    buyer: counterparty.clone(),
                    seller: None,
                    amount,
                    asset,
                },
            ));
        }
    }

    fn event(
        &self,
        block: &Block,
        tx: &Transaction,
        kind: EscrowEventKind,
        contract_ref: &str,
        escrow_id: &str,
        payload: EventPayload,
    ) -> EscrowEvent {
        EscrowEvent {
            chain: Chain::Cardano,
            kind,
            contract_ref: contract_ref.to_string(),
            escrow_id: escrow_id.to_string(),
            origin_tx_id: tx.id.clone(),
            origin_position: block.slot,
            observed_at: Utc::now(),
            payload,
        }
    }

    async fn roll_backward(&self, point: Point) {
        let applied = self
            .core
            .last_position()
            .await
            .map(|p| p.ordinal())
            .unwrap_or(0);

        if point.slot() < applied {
            warn!(
                "Cardano rolled back to {} below applied slot {}; escrow state is not reverted",
                point, applied
            );
        } else {
            info!("Cardano rolled back to {}", point);
        }
        crate::metrics::record_rollback(Chain::Cardano);

        let position = point.to_position();
        self.core.rewind_position(position.clone()).await;
        self.core.publish(WatcherNotification::Rollback {
            chain: Chain::Cardano,
            point: position,
        });
    }
}

/// Escrowed amount and asset qualifier of an output, per the contract's asset policy
fn escrow_amount(output: &TxOutput, contract: &EscrowContract) -> Option<(U256, Option<String>)> {
    match &contract.asset_policy {
        None => Some((U256::from(output.value.lovelace()), None)),
        Some(policy) => {
            let quantity = output.value.policy_quantity(policy)?;
            let asset = output
                .value
                .0
                .get(policy)
                .and_then(|assets| assets.keys().next())
                .map(|name| format!("{}.{}", policy, name));
            Some((U256::from(quantity), asset))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::cardano::{Redeemer, RedeemerPointer, TxInput, TxRef, Value};
    use crate::state::EscrowStatus;
    use std::collections::{BTreeMap, VecDeque};
    use std::time::Duration;

    const SCRIPT: &str = "addr_test1wzscript";
    const BUYER: &str = "addr_test1qbuyer";
    const SELLER: &str = "addr_test1qseller";

    type Script = Vec<RelayerResult<NextBlockResponse>>;

    #[derive(Default)]
    struct ScriptedConnector {
        sessions: std::sync::Mutex<VecDeque<Script>>,
        intersections: Arc<std::sync::Mutex<Vec<Vec<Point>>>>,
        reject_intersection: bool,
    }

    impl ScriptedConnector {
        fn new(sessions: Vec<Script>) -> Self {
            Self {
                sessions: std::sync::Mutex::new(sessions.into()),
                ..Default::default()
            }
        }
    }

    struct ScriptedClient {
        messages: VecDeque<RelayerResult<NextBlockResponse>>,
        intersections: Arc<std::sync::Mutex<Vec<Vec<Point>>>>,
        reject_intersection: bool,
    }

    #[async_trait]
    impl ChainSyncConnector for Arc<ScriptedConnector> {
        type Client = ScriptedClient;

        async fn connect(&self) -> RelayerResult<ScriptedClient> {
            let messages = self
                .sessions
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| RelayerError::connection(Chain::Cardano, "refused"))?;
            Ok(ScriptedClient {
                messages: messages.into(),
                intersections: self.intersections.clone(),
                reject_intersection: self.reject_intersection,
            })
        }
    }

    #[async_trait]
    impl ChainSyncClient for ScriptedClient {
        async fn find_intersection(
            &mut self,
            points: Vec<Point>,
        ) -> RelayerResult<IntersectionResponse> {
            self.intersections.lock().unwrap().push(points.clone());
            if self.reject_intersection {
                return Ok(IntersectionResponse::NotFound);
            }
            Ok(IntersectionResponse::Found(points[0].clone()))
        }

        async fn next_block(&mut self) -> RelayerResult<NextBlockResponse> {
            match self.messages.pop_front() {
                Some(message) => message,
                None => std::future::pending().await,
            }
        }
    }

    fn lovelace(amount: u64) -> Value {
        let mut ada = BTreeMap::new();
        ada.insert("lovelace".to_string(), amount);
        let mut value = BTreeMap::new();
        value.insert("ada".to_string(), ada);
        Value(value)
    }

    fn output(address: &str, value: Value, datum: bool) -> TxOutput {
        TxOutput {
            address: address.into(),
            value,
            datum: None,
            datum_hash: datum.then(|| "d1".to_string()),
        }
    }

    fn input(tx: &str, index: u32) -> TxInput {
        TxInput {
            transaction: TxRef { id: tx.into() },
            index,
        }
    }

    fn tx(id: &str, inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Transaction {
        Transaction {
            id: id.into(),
            inputs,
            outputs,
            redeemers: vec![],
        }
    }

    fn with_redeemer(mut tx: Transaction, index: u32, data: &str) -> Transaction {
        tx.redeemers.push(Redeemer {
            validator: RedeemerPointer {
                purpose: "spend".into(),
                index,
            },
            redeemer: data.into(),
        });
        tx
    }

    fn forward(slot: u64, transactions: Vec<Transaction>) -> RelayerResult<NextBlockResponse> {
        Ok(NextBlockResponse::RollForward {
            block: Block {
                id: format!("block{}", slot),
                slot,
                height: slot,
                transactions,
            },
        })
    }

    fn backward(slot: u64) -> RelayerResult<NextBlockResponse> {
        Ok(NextBlockResponse::RollBackward {
            point: Point::Specific {
                slot,
                id: format!("block{}", slot),
            },
        })
    }

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_secs(5), 3, Duration::from_secs(10))
    }

    fn watcher(connector: Arc<ScriptedConnector>) -> CardanoWatcher<Arc<ScriptedConnector>> {
        let watcher = CardanoWatcher::new(connector, None, policy());
        watcher.add_contract(EscrowContract::new(SCRIPT));
        watcher
    }

    async fn next_state(rx: &mut broadcast::Receiver<WatcherNotification>) -> EscrowState {
        loop {
            if let WatcherNotification::StateChange(state) = rx.recv().await.unwrap() {
                return state;
            }
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<WatcherNotification>) -> EscrowEvent {
        loop {
            if let WatcherNotification::Event(event) = rx.recv().await.unwrap() {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_funded_output_then_spend_releases_to_seller() {
        let connector = Arc::new(ScriptedConnector::new(vec![vec![
            forward(
                10,
                vec![tx(
                    "fund1",
                    vec![input("utxo0", 0)],
                    vec![
                        output(SCRIPT, lovelace(5_000_000), false),
                        output(BUYER, lovelace(1_000_000), false),
                    ],
                )],
            ),
            forward(
                20,
                vec![tx(
                    "spend1",
                    vec![input("fund1", 0)],
                    vec![output(SELLER, lovelace(4_800_000), false)],
                )],
            ),
        ]]));
        let watcher = watcher(connector);
        let mut rx = watcher.subscribe();
        watcher.start().await.unwrap();

        let funded = next_state(&mut rx).await;
        assert_eq!(funded.status, EscrowStatus::Funded);
        assert_eq!(funded.escrow_id, "fund1");
        assert_eq!(funded.buyer, BUYER);
        assert_eq!(funded.total_deposited, U256::from(5_000_000u64));

        let release = next_event(&mut rx).await;
        assert_eq!(release.kind, EscrowEventKind::Released);
        assert_eq!(release.escrow_id, "fund1");
        assert_eq!(release.origin_tx_id, "spend1");
        assert_eq!(release.payload.buyer.as_deref(), Some(BUYER));
        assert_eq!(release.payload.seller.as_deref(), Some(SELLER));
        assert_eq!(release.payload.amount, U256::from(5_000_000u64));

        let completed = next_state(&mut rx).await;
        assert_eq!(completed.status, EscrowStatus::Completed);
        assert_eq!(watcher.tracked_outputs(), 0);

        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_redeemers_drive_lifecycle_through_continuing_outputs() {
        let create = tx(
            "create1",
            vec![input("utxo0", 0)],
            vec![
                output(SCRIPT, lovelace(2_000_000), true),
                output(BUYER, lovelace(100), false),
            ],
        );
        // Fund(0) consumes the datum output and re-locks a larger one
        let fund = with_redeemer(
            tx(
                "fund2",
                vec![input("create1", 0), input("utxo1", 0)],
                vec![output(SCRIPT, lovelace(7_000_000), true)],
            ),
            0,
            "d87980",
        );
        let dispute = with_redeemer(
            tx(
                "dispute1",
                vec![input("fund2", 0)],
                vec![output(SCRIPT, lovelace(7_000_000), true)],
            ),
            0,
            "d87c80",
        );

        let connector = Arc::new(ScriptedConnector::new(vec![vec![
            forward(1, vec![create]),
            forward(2, vec![fund]),
            forward(3, vec![dispute]),
        ]]));
        let watcher = watcher(connector);
        let mut rx = watcher.subscribe();
        watcher.start().await.unwrap();

        assert_eq!(next_state(&mut rx).await.status, EscrowStatus::Created);
        assert_eq!(next_state(&mut rx).await.status, EscrowStatus::Funded);
        let disputed = next_state(&mut rx).await;
        assert_eq!(disputed.status, EscrowStatus::Disputed);
        assert_eq!(disputed.escrow_id, "create1");
        assert_eq!(watcher.all_escrow_states().await.len(), 1);
        assert_eq!(watcher.tracked_outputs(), 1);
    }

    #[tokio::test]
    async fn test_asset_policy_filters_and_sums_quantities() {
        let mut value = lovelace(2_000_000);
        let mut tokens = BTreeMap::new();
        tokens.insert("55534443".to_string(), 30);
        tokens.insert("55534444".to_string(), 12);
        value.0.insert("policy1".to_string(), tokens);

        let connector = Arc::new(ScriptedConnector::new(vec![vec![forward(
            5,
            vec![
                tx("ada_only", vec![], vec![output(SCRIPT, lovelace(9), false)]),
                tx("with_token", vec![], vec![output(SCRIPT, value, false)]),
            ],
        )]]));
        let watcher = CardanoWatcher::new(connector, None, policy());
        watcher.add_contract(EscrowContract {
            reference: SCRIPT.into(),
            active: true,
            asset_policy: Some("policy1".into()),
        });
        let mut rx = watcher.subscribe();
        watcher.start().await.unwrap();

        let state = next_state(&mut rx).await;
        assert_eq!(state.escrow_id, "with_token");
        assert_eq!(state.amount, U256::from(42u64));
        assert_eq!(state.asset.as_deref(), Some("policy1.55534443"));

        assert!(watcher.escrow_state(SCRIPT, "ada_only").await.is_none());
    }

    fn block(slot: u64, transactions: Vec<Transaction>) -> Block {
        Block {
            id: format!("block{}", slot),
            slot,
            height: slot,
            transactions,
        }
    }

    fn drain_releases(rx: &mut broadcast::Receiver<WatcherNotification>) -> Vec<EscrowEvent> {
        let mut releases = Vec::new();
        while let Ok(notification) = rx.try_recv() {
            if let WatcherNotification::Event(event) = notification {
                if event.kind == EscrowEventKind::Released {
                    releases.push(event);
                }
            }
        }
        releases
    }

    #[tokio::test]
    async fn test_spends_at_removed_contract_are_ignored() {
        let watcher = watcher(Arc::new(ScriptedConnector::default()));
        let mut rx = watcher.subscribe();

        let fund = tx(
            "fund",
            vec![input("utxo0", 0)],
            vec![output(SCRIPT, lovelace(5_000_000), false)],
        );
        watcher.driver.apply_block(&block(10, vec![fund])).await;
        assert_eq!(watcher.tracked_outputs(), 1);

        assert!(watcher.remove_contract(SCRIPT).is_some());
        assert_eq!(watcher.tracked_outputs(), 0);

        let spend = tx(
            "spend",
            vec![input("fund", 0)],
            vec![output(SELLER, lovelace(4_800_000), false)],
        );
        watcher.driver.apply_block(&block(20, vec![spend])).await;

        assert!(drain_releases(&mut rx).is_empty());
        let state = watcher.escrow_state(SCRIPT, "fund").await.unwrap();
        assert_eq!(state.status, EscrowStatus::Funded);
    }

    #[tokio::test]
    async fn test_spends_at_deactivated_contract_are_dropped() {
        let watcher = watcher(Arc::new(ScriptedConnector::default()));
        let mut rx = watcher.subscribe();

        let fund = tx("fund", vec![], vec![output(SCRIPT, lovelace(5_000_000), false)]);
        watcher.driver.apply_block(&block(10, vec![fund])).await;

        watcher.add_contract(EscrowContract {
            reference: SCRIPT.into(),
            active: false,
            asset_policy: None,
        });
        let spend = tx("spend", vec![input("fund", 0)], vec![output(SELLER, lovelace(1), false)]);
        watcher.driver.apply_block(&block(20, vec![spend])).await;

        assert!(drain_releases(&mut rx).is_empty());
        assert_eq!(watcher.tracked_outputs(), 0);
    }

    #[tokio::test]
    async fn test_rollback_is_published_without_reverting_state() {
        let connector = Arc::new(ScriptedConnector::new(vec![vec![
            Ok(NextBlockResponse::RollBackward {
                point: Point::Origin,
            }),
            forward(
                100,
                vec![tx("fund1", vec![], vec![output(SCRIPT, lovelace(10), false)])],
            ),
            forward(200, vec![]),
            backward(100),
        ]]));
        let watcher = watcher(connector);
        let mut rx = watcher.subscribe();
        watcher.start().await.unwrap();

        let point = loop {
            if let WatcherNotification::Rollback { point, .. } = rx.recv().await.unwrap() {
                break point;
            }
        };
        assert_eq!(
            point,
            Some(ChainPosition::Slot {
                slot: 100,
                id: "block100".into()
            })
        );
        assert_eq!(watcher.connection_status().await.last_position, point);
        assert_eq!(
            watcher.escrow_state(SCRIPT, "fund1").await.unwrap().status,
            EscrowStatus::Funded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resumes_from_last_slot() {
        let start = Point::Specific {
            slot: 1,
            id: "genesis-ish".into(),
        };
        let connector = Arc::new(ScriptedConnector::new(vec![
            vec![
                forward(50, vec![]),
                Err(RelayerError::connection(Chain::Cardano, "socket closed")),
            ],
            vec![],
        ]));
        let watcher = CardanoWatcher::new(connector.clone(), Some(start.clone()), policy());
        let mut rx = watcher.subscribe();
        watcher.start().await.unwrap();

        // Initial connect, then the reconnect
        let mut connects = 0;
        while connects < 2 {
            if let WatcherNotification::Connected { .. } = rx.recv().await.unwrap() {
                connects += 1;
            }
        }

        let intersections = connector.intersections.lock().unwrap().clone();
        assert_eq!(intersections.len(), 2);
        assert_eq!(intersections[0], vec![start.clone()]);
        assert_eq!(
            intersections[1],
            vec![
                Point::Specific {
                    slot: 50,
                    id: "block50".into()
                },
                start
            ]
        );
        assert_eq!(watcher.connection_status().await.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_missing_intersection_fails_start() {
        let connector = Arc::new(ScriptedConnector {
            sessions: std::sync::Mutex::new(vec![vec![]].into()),
            reject_intersection: true,
            ..Default::default()
        });
        let watcher = watcher(connector.clone());

        let err = watcher.start().await.unwrap_err();
        assert!(matches!(err, RelayerError::IntersectionNotFound { .. }));
        assert_eq!(connector.intersections.lock().unwrap()[0], vec![Point::Origin]);
    }
}
