//! Ethereum JSON-RPC client with separate primary and archive endpoints.
//!
//! Calls against the latest block go to the primary node; calls that name a
//! block go to the archive node.

mod batchable;
mod rpc;
mod types;

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, B256, Bytes, U256};
use num_bigint::BigInt;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    config::{CLIENT_CLOSE_DELAY, Reloadable},
    context::RequestContext,
    error::Result,
    reconnect::release_later,
};

pub use batchable::{BatchableEthCfg, BatchableEthClient};
pub use rpc::{HttpRpcClient, RpcCall, RpcTransport};
pub use types::{
    CallMsg, FINALIZED_BLOCK, PENDING_BLOCK, SAFE_BLOCK, to_block_num_arg, to_call_arg,
};

use types::{decode_bytes, decode_quantity, decode_u256, hex_address, hex_word};

#[derive(Clone)]
pub struct EthClient {
    primary: Arc<dyn RpcTransport>,
    archive: Arc<dyn RpcTransport>,
}

impl std::fmt::Debug for EthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EthClient")
            .field("shared_archive", &Arc::ptr_eq(&self.primary, &self.archive))
            .finish()
    }
}

impl EthClient {
    pub fn new(primary: Arc<dyn RpcTransport>, archive: Arc<dyn RpcTransport>) -> Self {
        Self { primary, archive }
    }

    /// One transport for both roles.
    pub fn single(transport: Arc<dyn RpcTransport>) -> Self {
        Self::new(transport.clone(), transport)
    }

    pub fn client_for(&self, block: Option<&BigInt>) -> &Arc<dyn RpcTransport> {
        match block {
            None => &self.primary,
            Some(_) => &self.archive,
        }
    }

    pub async fn call_contract(
        &self,
        ctx: &RequestContext,
        msg: &CallMsg,
        block: Option<&BigInt>,
    ) -> Result<Bytes> {
        let params = json!([to_call_arg(msg), to_block_num_arg(block)]);
        let value = self.client_for(block).call(ctx, "eth_call", params).await?;
        decode_bytes(value)
    }

    pub async fn balance_at(
        &self,
        ctx: &RequestContext,
        account: Address,
        block: Option<&BigInt>,
    ) -> Result<U256> {
        let value = self.account_call(ctx, "eth_getBalance", account, block).await?;
        decode_u256(&value)
    }

    pub async fn code_at(
        &self,
        ctx: &RequestContext,
        account: Address,
        block: Option<&BigInt>,
    ) -> Result<Bytes> {
        let value = self.account_call(ctx, "eth_getCode", account, block).await?;
        decode_bytes(value)
    }

    pub async fn nonce_at(
        &self,
        ctx: &RequestContext,
        account: Address,
        block: Option<&BigInt>,
    ) -> Result<u64> {
        let value = self
            .account_call(ctx, "eth_getTransactionCount", account, block)
            .await?;
        decode_quantity(&value)
    }

    pub async fn storage_at(
        &self,
        ctx: &RequestContext,
        account: Address,
        key: B256,
        block: Option<&BigInt>,
    ) -> Result<Bytes> {
        let params = json!([hex_address(&account), hex_word(&key), to_block_num_arg(block)]);
        let value = self
            .client_for(block)
            .call(ctx, "eth_getStorageAt", params)
            .await?;
        decode_bytes(value)
    }

    pub async fn block_number(&self, ctx: &RequestContext) -> Result<u64> {
        let value = self.primary.call(ctx, "eth_blockNumber", json!([])).await?;
        decode_quantity(&value)
    }

    async fn account_call(
        &self,
        ctx: &RequestContext,
        method: &str,
        account: Address,
        block: Option<&BigInt>,
    ) -> Result<Value> {
        let params = json!([hex_address(&account), to_block_num_arg(block)]);
        self.client_for(block).call(ctx, method, params).await
    }
}

/// Hot-reloadable endpoints. The client is redialed on every update.
#[derive(Clone, Deserialize)]
pub struct EthCfg {
    pub url: String,
    #[serde(default)]
    pub archive_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(skip)]
    client: Option<Arc<EthClient>>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl EthCfg {
    pub fn new(url: impl Into<String>, archive_url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            archive_url: archive_url.into(),
            timeout_ms: default_timeout_ms(),
            client: None,
        }
    }

    pub fn client(&self) -> Option<&Arc<EthClient>> {
        self.client.as_ref()
    }

    /// Prepares both endpoints. When only one of them is usable it serves
    /// both roles; when neither is, the primary's error is returned.
    pub fn dial(&self) -> Result<EthClient> {
        let timeout = Duration::from_millis(self.timeout_ms);
        let primary = HttpRpcClient::dial(&self.url, timeout);
        let archive = HttpRpcClient::dial(&self.archive_url, timeout);

        let (primary, archive): (Arc<dyn RpcTransport>, Arc<dyn RpcTransport>) = match (primary, archive) {
            (Ok(primary), Ok(archive)) => (Arc::new(primary), Arc::new(archive)),
            (Ok(primary), Err(err)) => {
                tracing::debug!(error = %err, "archive endpoint unusable, using primary for both");
                let primary: Arc<dyn RpcTransport> = Arc::new(primary);
                (primary.clone(), primary)
            }
            (Err(err), Ok(archive)) => {
                tracing::warn!(error = %err, "primary endpoint unusable, using archive for both");
                let archive: Arc<dyn RpcTransport> = Arc::new(archive);
                (archive.clone(), archive)
            }
            (Err(err), Err(_)) => return Err(err),
        };
        Ok(EthClient::new(primary, archive))
    }
}

impl std::fmt::Debug for EthCfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EthCfg")
            .field("timeout_ms", &self.timeout_ms)
            .field("connected", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

impl Reloadable for EthCfg {
    fn on_update(old: Option<&Self>, new: &mut Self) {
        if let Some(client) = old.and_then(|old| old.client.clone()) {
            release_later(client, CLIENT_CLOSE_DELAY, "eth".to_string());
        }
        new.client = match new.dial() {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                tracing::error!(error = %err, "failed to dial eth endpoints");
                None
            }
        };
    }
}
