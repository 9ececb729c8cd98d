//! `eth_call` batching.
//!
//! Calls are collected per lane (latest block, explicit block) and sent as one
//! JSON-RPC batch per window. Every caller gets its own element of the batch
//! response, or the batch's error when the whole request failed.

use std::{sync::Arc, time::Duration};

use alloy_primitives::Bytes;
use metrics::counter;
use num_bigint::BigInt;
use serde::Deserialize;
use serde_json::json;

use super::{
    CallMsg, EthCfg, EthClient,
    rpc::RpcCall,
    types::{decode_bytes, to_block_num_arg, to_call_arg},
};
use crate::{
    batcher::{BatchConfig, Batcher},
    config::{CLIENT_CLOSE_DELAY, Reloadable},
    context::RequestContext,
    error::{Error, Result},
    observability::metrics::{ETH_BATCH_FAILURES_TOTAL, ETH_BATCH_RETRIES_TOTAL},
    retry::{BackoffCfg, BackoffPolicy},
    task::{Resolver, Task},
};

const LATEST_LANE: &str = "eth_call_latest";
const ARCHIVE_LANE: &str = "eth_call_archive";

struct PendingCall {
    msg: CallMsg,
    block: Option<BigInt>,
    resolver: Resolver<Bytes>,
}

pub struct BatchableEthClient {
    eth: Arc<EthClient>,
    latest: Batcher<PendingCall>,
    archive: Batcher<PendingCall>,
}

impl BatchableEthClient {
    pub fn new<P>(eth: Arc<EthClient>, config: BatchConfig, policy: P) -> Self
    where
        P: BackoffPolicy + 'static,
    {
        let policy = Arc::new(policy);
        Self {
            latest: lane(LATEST_LANE, config, eth.clone(), policy.clone()),
            archive: lane(ARCHIVE_LANE, config, eth.clone(), policy),
            eth,
        }
    }

    /// The underlying client, for calls that are not batched.
    pub fn eth(&self) -> &Arc<EthClient> {
        &self.eth
    }

    /// Same contract as [`EthClient::call_contract`], but the call is sent as
    /// part of the next batch of its lane.
    pub async fn call_contract(
        &self,
        ctx: &RequestContext,
        msg: CallMsg,
        block: Option<&BigInt>,
    ) -> Result<Bytes> {
        let (task, resolver) = Task::new(ctx.clone());
        let batcher = match block {
            None => &self.latest,
            Some(_) => &self.archive,
        };
        batcher.submit(PendingCall {
            msg,
            block: block.cloned(),
            resolver,
        })?;
        task.result().await
    }

    /// Flushes pending calls and rejects new ones.
    pub fn close(&self) {
        self.latest.close();
        self.archive.close();
    }
}

fn lane<P>(
    name: &'static str,
    config: BatchConfig,
    eth: Arc<EthClient>,
    policy: Arc<P>,
) -> Batcher<PendingCall>
where
    P: BackoffPolicy + 'static,
{
    Batcher::new(name, config, move |calls| {
        batch_calls(name, eth.clone(), policy.clone(), calls)
    })
}

async fn batch_calls<P: BackoffPolicy>(
    lane: &'static str,
    eth: Arc<EthClient>,
    policy: Arc<P>,
    calls: Vec<PendingCall>,
) {
    let calls: Vec<PendingCall> = calls
        .into_iter()
        .filter(|call| !call.resolver.is_abandoned())
        .collect();
    let (Some(first), Some(last)) = (calls.first(), calls.last()) else {
        return;
    };

    // The batch serves many callers; none of them may cancel it for the others.
    let ctx = last.resolver.ctx().without_cancel();
    let transport = eth.client_for(first.block.as_ref());
    let requests: Vec<RpcCall> = calls
        .iter()
        .map(|call| {
            RpcCall::new(
                "eth_call",
                json!([to_call_arg(&call.msg), to_block_num_arg(call.block.as_ref())]),
            )
        })
        .collect();

    let result = policy
        .retry_notify(
            || transport.batch_call(&ctx, &requests),
            |err: &Error, wait: Duration| {
                tracing::warn!(
                    lane,
                    size = requests.len(),
                    error = %err,
                    retry_in_ms = wait.as_millis() as u64,
                    "eth_call batch failed, retrying"
                );
                counter!(ETH_BATCH_RETRIES_TOTAL, "lane" => lane).increment(1);
            },
        )
        .await;

    match result {
        Ok(results) => {
            let mut results = results.into_iter();
            for call in &calls {
                let result = results
                    .next()
                    .unwrap_or_else(|| Err(Error::Decode("batch response shorter than request".into())));
                call.resolver.resolve(result.and_then(decode_bytes));
            }
        }
        Err(err) => {
            tracing::error!(lane, size = calls.len(), error = %err, "eth_call batch failed");
            counter!(ETH_BATCH_FAILURES_TOTAL, "lane" => lane).increment(1);
            for call in &calls {
                call.resolver.resolve(Err(err.clone()));
            }
        }
    }
}

/// Hot-reloadable batching client: endpoints, window limits and retry policy.
#[derive(Clone, Deserialize)]
pub struct BatchableEthCfg {
    #[serde(flatten)]
    pub eth: EthCfg,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub backoff: BackoffCfg,
    #[serde(skip)]
    client: Option<Arc<BatchableEthClient>>,
}

impl BatchableEthCfg {
    pub fn new(eth: EthCfg, batch: BatchConfig, backoff: BackoffCfg) -> Self {
        Self {
            eth,
            batch,
            backoff,
            client: None,
        }
    }

    pub fn client(&self) -> Option<&Arc<BatchableEthClient>> {
        self.client.as_ref()
    }
}

impl std::fmt::Debug for BatchableEthCfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchableEthCfg")
            .field("eth", &self.eth)
            .field("batch", &self.batch)
            .field("backoff", &self.backoff)
            .field("connected", &self.client.is_some())
            .finish()
    }
}

impl Reloadable for BatchableEthCfg {
    fn on_update(old: Option<&Self>, new: &mut Self) {
        EthCfg::on_update(old.map(|old| &old.eth), &mut new.eth);
        BackoffCfg::on_update(old.map(|old| &old.backoff), &mut new.backoff);

        if let Some(client) = old.and_then(|old| old.client.clone()) {
            close_later(client, CLIENT_CLOSE_DELAY);
        }
        new.client = new.eth.client().map(|eth| {
            Arc::new(BatchableEthClient::new(
                eth.clone(),
                new.batch,
                new.backoff.policy().clone(),
            ))
        });
    }
}

fn close_later(client: Arc<BatchableEthClient>, delay: Duration) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                client.close();
            });
        }
        // Without a runtime no window can be pending.
        Err(_) => drop(client),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use alloy_primitives::Address;
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::{client::eth::RpcTransport, retry::ExponentialPolicy};

    /// Echoes each call's `data` back, or fails every batch while `failing` is set.
    #[derive(Default)]
    struct EchoNode {
        failing: bool,
        attempts: AtomicUsize,
        batches: Mutex<Vec<Vec<RpcCall>>>,
    }

    #[async_trait]
    impl RpcTransport for EchoNode {
        async fn call(&self, _ctx: &RequestContext, _method: &str, _params: Value) -> Result<Value> {
            Err(Error::Transport("single calls are not expected".into()))
        }

        async fn batch_call(&self, _ctx: &RequestContext, calls: &[RpcCall]) -> Result<Vec<Result<Value>>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing {
                return Err(Error::Transport("connection reset by peer".into()));
            }
            self.batches.lock().unwrap().push(calls.to_vec());
            Ok(calls
                .iter()
                .map(|call| Ok(call.params[0]["data"].clone()))
                .collect())
        }
    }

    fn batchable(node: Arc<EchoNode>, max_count: usize, max_retries: Option<u64>) -> BatchableEthClient {
        let eth = Arc::new(EthClient::single(node));
        BatchableEthClient::new(
            eth,
            BatchConfig::new(Duration::from_secs(3600), max_count),
            ExponentialPolicy::for_testing(max_retries),
        )
    }

    fn msg(selector: u8) -> CallMsg {
        CallMsg::new(Address::repeat_byte(0xaa), vec![selector])
    }

    #[tokio::test]
    async fn test_three_calls_share_one_batch_in_order() {
        let node = Arc::new(EchoNode::default());
        let client = batchable(node.clone(), 3, None);
        let ctx = RequestContext::background();

        let (a, b, c) = tokio::join!(
            client.call_contract(&ctx, msg(1), None),
            client.call_contract(&ctx, msg(2), None),
            client.call_contract(&ctx, msg(3), None),
        );
        assert_eq!(a.unwrap(), Bytes::from_static(&[1]));
        assert_eq!(b.unwrap(), Bytes::from_static(&[2]));
        assert_eq!(c.unwrap(), Bytes::from_static(&[3]));

        let batches = node.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[0][0].params[1], json!("latest"));
    }

    #[tokio::test]
    async fn test_failed_batch_fans_out_same_error() {
        let node = Arc::new(EchoNode {
            failing: true,
            ..Default::default()
        });
        let client = batchable(node.clone(), 3, Some(1));
        let ctx = RequestContext::background();

        let (a, b, c) = tokio::join!(
            client.call_contract(&ctx, msg(1), None),
            client.call_contract(&ctx, msg(2), None),
            client.call_contract(&ctx, msg(3), None),
        );
        let errors: Vec<String> = [a, b, c]
            .into_iter()
            .map(|res| res.unwrap_err().to_string())
            .collect();
        assert!(errors.iter().all(|err| err == &errors[0]));
        assert!(errors[0].contains("connection reset by peer"));
        // One attempt plus one retry.
        assert_eq!(node.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_explicit_block_uses_archive_lane() {
        let node = Arc::new(EchoNode::default());
        let client = batchable(node.clone(), 2, None);
        let ctx = RequestContext::background();
        let block = BigInt::from(12345);
        let pending = BigInt::from(-1);

        let (a, b) = tokio::join!(
            client.call_contract(&ctx, msg(1), Some(&block)),
            client.call_contract(&ctx, msg(2), Some(&pending)),
        );
        assert_eq!(a.unwrap(), Bytes::from_static(&[1]));
        assert_eq!(b.unwrap(), Bytes::from_static(&[2]));

        let batches = node.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].params[1], json!("0x3039"));
        assert_eq!(batches[0][1].params[1], json!("pending"));
    }

    #[tokio::test]
    async fn test_abandoned_calls_are_left_out() {
        let node = Arc::new(EchoNode::default());
        let client = batchable(node.clone(), 2, None);

        let gone = RequestContext::background();
        gone.cancel();
        let res = client.call_contract(&gone, msg(1), None).await;
        assert!(matches!(res, Err(Error::Canceled)));

        let res = client
            .call_contract(&RequestContext::background(), msg(2), None)
            .await;
        assert_eq!(res.unwrap(), Bytes::from_static(&[2]));

        let batches = node.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
    }

    #[tokio::test]
    async fn test_close_flushes_then_rejects() {
        let node = Arc::new(EchoNode::default());
        let client = batchable(node.clone(), 100, None);
        let ctx = RequestContext::background();

        // The call is submitted before close runs, so close has to flush it.
        let (res, ()) = tokio::join!(client.call_contract(&ctx, msg(7), None), async {
            client.close()
        });
        assert_eq!(res.unwrap(), Bytes::from_static(&[7]));
        assert!(matches!(
            client.call_contract(&ctx, msg(8), None).await,
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_cfg_from_flat_json() {
        let mut cfg: BatchableEthCfg = serde_json::from_value(json!({
            "url": "http://primary:8545",
            "archive_url": "http://archive:8545",
            "batch": {"max_wait_ms": 5, "max_count": 20},
            "backoff": {"max_retries": 3},
        }))
        .unwrap();
        assert_eq!(cfg.batch, BatchConfig::new(Duration::from_millis(5), 20));

        BatchableEthCfg::on_update(None, &mut cfg);
        assert!(cfg.eth.client().is_some());
        assert!(cfg.client().is_some());
        assert_eq!(cfg.backoff.policy().max_retries(), Some(3));
    }
}
