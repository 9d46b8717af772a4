//! Stream sources behind the watchers
//!
//! - [`LogSource`]: escrow contract logs from an EVM node over WebSocket
//! - [`ChainSyncConnector`]: Ogmios chain-sync sessions for Cardano
//!
//! Both are traits so the watchers can be driven by scripted sources in tests.

use crate::error::{RelayerError, RelayerResult};
use crate::events::cardano::{Block, IntersectionResponse, NextBlockResponse, Point, Transaction};
use crate::events::Chain;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::Ws;
use futures::stream::{self, Stream, StreamExt};
use futures::SinkExt;
use serde::Deserialize;
use serde_json::json;
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Ogmios error code for a failed `findIntersection`
const INTERSECTION_NOT_FOUND: i64 = 1000;

/// Which logs an EVM subscription delivers
#[derive(Debug, Clone, PartialEq)]
pub struct LogFilter {
    pub addresses: Vec<Address>,
    /// Accepted topic0 values
    pub topics: Vec<H256>,
    /// Replay historical logs from this block before streaming new ones
    pub from_block: Option<u64>,
}

impl LogFilter {
    fn to_filter(&self) -> Filter {
        Filter::new()
            .address(ValueOrArray::Array(self.addresses.clone()))
            .topic0(ValueOrArray::Array(
                self.topics.iter().copied().map(Some).collect(),
            ))
    }
}

pub type LogStream = Pin<Box<dyn Stream<Item = RelayerResult<Log>> + Send>>;

/// Source of escrow contract logs
#[async_trait]
pub trait LogSource: Send + Sync + 'static {
    /// Open a log subscription; the stream ends when the connection drops
    async fn subscribe(&self, filter: LogFilter) -> RelayerResult<LogStream>;
}

/// `eth_subscribe("logs")` over an `ethers` WebSocket provider
#[derive(Debug, Clone)]
pub struct WsLogSource {
    ws_url: String,
}

impl WsLogSource {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }
}

#[async_trait]
impl LogSource for WsLogSource {
    async fn subscribe(&self, filter: LogFilter) -> RelayerResult<LogStream> {
        let provider = Provider::<Ws>::connect(self.ws_url.as_str())
            .await
            .map_err(|e| RelayerError::connection(Chain::Ethereum, e))?;
        info!("WebSocket connected to {}", self.ws_url);

        let live_filter = filter.to_filter();

        // Subscribe before the backfill so no log falls between the two
        let (tx, rx) = mpsc::channel::<RelayerResult<Log>>(1_000);
        let (ready_tx, ready_rx) = oneshot::channel::<RelayerResult<()>>();

        let subscriber = provider.clone();
        let subscribe_filter = live_filter.clone();
        tokio::spawn(async move {
            let mut subscription = match subscriber.subscribe_logs(&subscribe_filter).await {
                Ok(s) => {
                    let _ = ready_tx.send(Ok(()));
                    s
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(RelayerError::connection(Chain::Ethereum, e)));
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = subscription.next() => match next {
                        Some(log) => {
                            if tx.send(Ok(log)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            debug!("Log subscription ended");
                            break;
                        }
                    }
                }
            }
        });

        ready_rx.await.map_err(|_| {
            RelayerError::connection(Chain::Ethereum, "subscription task exited")
        })??;

        let backfill = match filter.from_block {
            Some(from) => {
                let history = live_filter.clone().from_block(from);
                let logs = provider
                    .get_logs(&history)
                    .await
                    .map_err(|e| RelayerError::connection(Chain::Ethereum, e))?;
                debug!("Replaying {} logs from block {}", logs.len(), from);
                logs
            }
            None => Vec::new(),
        };

        let live = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(stream::iter(backfill.into_iter().map(Ok)).chain(live).boxed())
    }
}

/// One Ogmios chain-sync session
#[async_trait]
pub trait ChainSyncClient: Send + 'static {
    /// Find the most recent of `points` the node knows
    async fn find_intersection(&mut self, points: Vec<Point>)
        -> RelayerResult<IntersectionResponse>;

    /// Request the next chain-sync message
    async fn next_block(&mut self) -> RelayerResult<NextBlockResponse>;
}

/// Opens chain-sync sessions
#[async_trait]
pub trait ChainSyncConnector: Send + Sync + 'static {
    type Client: ChainSyncClient;

    async fn connect(&self) -> RelayerResult<Self::Client>;
}

/// Ogmios v6 JSON-RPC over a plain WebSocket
#[derive(Debug, Clone)]
pub struct OgmiosConnector {
    url: String,
}

impl OgmiosConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl ChainSyncConnector for OgmiosConnector {
    type Client = OgmiosClient;

    async fn connect(&self) -> RelayerResult<OgmiosClient> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RelayerError::connection(Chain::Cardano, e))?;
        info!("Ogmios connected at {}", self.url);
        Ok(OgmiosClient { socket, next_id: 0 })
    }
}

/// One chain-sync session. Requests go out one at a time and each waits for the reply
/// carrying its id; other frames are skipped.
pub struct OgmiosClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcFault>,
}

#[derive(Debug, Deserialize)]
struct RpcFault {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct IntersectionResult {
    intersection: Point,
}

fn socket_error(e: impl ToString) -> RelayerError {
    RelayerError::connection(Chain::Cardano, e)
}

impl OgmiosClient {
    /// Send a request and wait for its reply: `Ok(Err(fault))` when Ogmios answered with an error
    async fn call(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> RelayerResult<Result<serde_json::Value, RpcFault>> {
        self.next_id += 1;
        let id = json!(self.next_id);
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        self.socket
            .send(Message::Text(request.to_string()))
            .await
            .map_err(socket_error)?;

        loop {
            let text = match self.socket.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(socket_error("Ogmios closed the connection"))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(socket_error(e)),
            };

            let reply: RpcReply = match serde_json::from_str(&text) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Ignoring malformed Ogmios frame: {}", e);
                    continue;
                }
            };
            if reply.id.as_ref() != Some(&id) {
                debug!("Ignoring Ogmios frame for id {:?}", reply.id);
                continue;
            }

            return match (reply.result, reply.error) {
                (_, Some(fault)) => Ok(Err(fault)),
                (Some(result), None) => Ok(Ok(result)),
                (None, None) => Err(RelayerError::Decode(format!(
                    "{} reply has neither result nor error",
                    method
                ))),
            };
        }
    }
}

#[async_trait]
impl ChainSyncClient for OgmiosClient {
    async fn find_intersection(
        &mut self,
        points: Vec<Point>,
    ) -> RelayerResult<IntersectionResponse> {
        match self
            .call("findIntersection", json!({ "points": points }))
            .await?
        {
            Ok(result) => {
                let found: IntersectionResult = serde_json::from_value(result)
                    .map_err(|e| RelayerError::Decode(format!("findIntersection: {}", e)))?;
                Ok(IntersectionResponse::Found(found.intersection))
            }
            Err(fault) if fault.code == INTERSECTION_NOT_FOUND => Ok(IntersectionResponse::NotFound),
            Err(fault) => Err(socket_error(format!(
                "findIntersection failed ({}): {}",
                fault.code, fault.message
            ))),
        }
    }

    async fn next_block(&mut self) -> RelayerResult<NextBlockResponse> {
        match self.call("nextBlock", json!({})).await? {
            Ok(result) => decode_next_block(result),
            Err(fault) => Err(socket_error(format!(
                "nextBlock failed ({}): {}",
                fault.code, fault.message
            ))),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
enum RawNextBlock {
    Forward { block: RawBlock },
    Backward { point: Point },
}

#[derive(Deserialize)]
struct RawBlock {
    id: String,
    #[serde(default)]
    slot: u64,
    #[serde(default)]
    height: u64,
    #[serde(default)]
    transactions: Vec<serde_json::Value>,
}

/// Decode a `nextBlock` result.
///
/// Transactions decode one at a time; an undecodable one is dropped and the rest of its
/// block is kept.
pub fn decode_next_block(raw: serde_json::Value) -> RelayerResult<NextBlockResponse> {
    let message: RawNextBlock = serde_json::from_value(raw)
        .map_err(|e| RelayerError::Decode(format!("nextBlock: {}", e)))?;

    let block = match message {
        RawNextBlock::Backward { point } => return Ok(NextBlockResponse::RollBackward { point }),
        RawNextBlock::Forward { block } => block,
    };

    let mut transactions = Vec::with_capacity(block.transactions.len());
    for (index, raw_tx) in block.transactions.into_iter().enumerate() {
        match serde_json::from_value::<Transaction>(raw_tx) {
            Ok(tx) => transactions.push(tx),
            Err(e) => {
                warn!(
                    "Dropping undecodable transaction {} of block {} at slot {}: {}",
                    index, block.id, block.slot, e
                );
                crate::metrics::record_decode_error(Chain::Cardano);
            }
        }
    }

    Ok(NextBlockResponse::RollForward {
        block: Block {
            id: block.id,
            slot: block.slot,
            height: block.height,
            transactions,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_builds_address_and_topic_sets() {
        let filter = LogFilter {
            addresses: vec![Address::repeat_byte(1), Address::repeat_byte(2)],
            topics: crate::events::evm::topics::all(),
            from_block: Some(10),
        }
        .to_filter();

        assert_eq!(
            filter.address,
            Some(ValueOrArray::Array(vec![
                Address::repeat_byte(1),
                Address::repeat_byte(2)
            ]))
        );
        match &filter.topics[0] {
            Some(ValueOrArray::Array(topics)) => assert_eq!(topics.len(), 7),
            other => panic!("unexpected topic0 {:?}", other),
        }
    }

    #[test]
    fn test_malformed_transactions_keep_block_position() {
        let raw = json!({
            "direction": "forward",
            "block": {
                "id": "b9",
                "slot": 900,
                "height": 12,
                "transactions": [{"id": 5, "outputs": "garbage"}]
            }
        });

        match decode_next_block(raw).unwrap() {
            NextBlockResponse::RollForward { block } => {
                assert_eq!(block.slot, 900);
                assert_eq!(block.id, "b9");
                assert!(block.transactions.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_transaction_is_dropped_alone() {
        let raw = json!({
            "direction": "forward",
            "block": {
                "id": "b10",
                "slot": 1000,
                "transactions": [
                    {"id": "good1", "outputs": [{"address": "addr_test1wscript", "value": {"ada": {"lovelace": 5}}}]},
                    {"id": 7},
                    {"id": "good2"}
                ]
            }
        });

        let NextBlockResponse::RollForward { block } = decode_next_block(raw).unwrap() else {
            panic!("expected a forward block");
        };
        let ids: Vec<&str> = block.transactions.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["good1", "good2"]);
        assert_eq!(block.transactions[0].outputs[0].value.lovelace(), 5);
    }

    #[test]
    fn test_unrecognized_message_is_decode_error() {
        let err = decode_next_block(json!({"direction": "sideways"})).unwrap_err();
        assert!(matches!(err, RelayerError::Decode(_)));
    }

    #[test]
    fn test_well_formed_backward_passes_through() {
        let resp = decode_next_block(json!({"direction": "backward", "point": "origin"})).unwrap();
        assert_eq!(resp, NextBlockResponse::RollBackward { point: Point::Origin });
    }

    /// Accept one connection and answer each request with the frames `answer` returns
    async fn serve_ogmios<F>(answer: F) -> String
    where
        F: Fn(&str, &serde_json::Value) -> Vec<serde_json::Value> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let request: serde_json::Value = serde_json::from_str(&text).unwrap();
                let method = request["method"].as_str().unwrap_or_default().to_string();
                for frame in answer(&method, &request["id"]) {
                    ws.send(Message::Text(frame.to_string())).await.unwrap();
                }
            }
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_ogmios_client_reads_replies_that_name_their_method() {
        let url = serve_ogmios(|method, id| match method {
            "findIntersection" => vec![
                json!({"jsonrpc": "2.0", "method": "findIntersection", "result": {"intersection": "origin"}, "id": "someone-else"}),
                json!({
                    "jsonrpc": "2.0",
                    "method": "findIntersection",
                    "result": {"intersection": "origin", "tip": {"slot": 100, "id": "aa"}},
                    "id": id
                }),
            ],
            "nextBlock" => vec![json!({
                "jsonrpc": "2.0",
                "method": "nextBlock",
                "result": {
                    "direction": "forward",
                    "block": {"type": "praos", "id": "b1", "slot": 12, "height": 3, "transactions": [{"id": "t1"}]},
                    "tip": {"slot": 100, "id": "aa"}
                },
                "id": id
            })],
            _ => vec![],
        })
        .await;

        let mut client = OgmiosConnector::new(url).connect().await.unwrap();
        let found = client.find_intersection(vec![Point::Origin]).await.unwrap();
        assert_eq!(found, IntersectionResponse::Found(Point::Origin));

        match client.next_block().await.unwrap() {
            NextBlockResponse::RollForward { block } => {
                assert_eq!(block.slot, 12);
                assert_eq!(block.transactions.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ogmios_intersection_fault_maps_to_not_found() {
        let url = serve_ogmios(|method, id| {
            vec![json!({
                "jsonrpc": "2.0",
                "method": method,
                "error": {"code": 1000, "message": "No intersection found.", "data": {"tip": "origin"}},
                "id": id
            })]
        })
        .await;

        let mut client = OgmiosConnector::new(url).connect().await.unwrap();
        let points = vec![Point::Specific {
            slot: 5,
            id: "ab".into(),
        }];
        assert_eq!(
            client.find_intersection(points).await.unwrap(),
            IntersectionResponse::NotFound
        );
    }

    #[tokio::test]
    async fn test_ogmios_closed_socket_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = ws.next().await;
            let _ = ws.close(None).await;
        });

        let mut client = OgmiosConnector::new(format!("ws://{}", addr))
            .connect()
            .await
            .unwrap();
        let err = client.next_block().await.unwrap_err();
        assert!(matches!(err, RelayerError::Connection { chain: Chain::Cardano, .. }));
    }
}
