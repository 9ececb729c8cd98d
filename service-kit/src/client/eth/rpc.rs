//! JSON-RPC 2.0 over HTTP.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use metrics::{counter, histogram};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    context::RequestContext,
    error::{Error, Result},
    observability::{
        metrics::{RPC_REQUEST_DURATION_SECONDS, RPC_REQUESTS_TOTAL},
        propagation_headers,
    },
};

const JSONRPC_VERSION: &str = "2.0";

/// One element of a batch request.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcCall {
    pub method: &'static str,
    pub params: Value,
}

impl RpcCall {
    pub fn new(method: &'static str, params: Value) -> Self {
        Self { method, params }
    }
}

/// Something that can carry JSON-RPC requests to a node.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, ctx: &RequestContext, method: &str, params: Value) -> Result<Value>;

    /// Sends all calls in one request.
    ///
    /// The outer error means the request as a whole failed. Otherwise there is
    /// one entry per call, in call order, holding that call's own outcome.
    async fn batch_call(&self, ctx: &RequestContext, calls: &[RpcCall]) -> Result<Vec<Result<Value>>>;
}

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ResponseError>,
}

#[derive(Debug, Deserialize)]
struct ResponseError {
    code: i64,
    message: String,
}

impl Response {
    fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(Error::Rpc {
                code: err.code,
                message: err.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Nodes answer a rejected batch with a single error object instead of an array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchReply {
    Many(Vec<Response>),
    One(Response),
}

pub struct HttpRpcClient {
    url: Url,
    http: Client,
    next_id: AtomicU64,
}

impl std::fmt::Debug for HttpRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRpcClient")
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpRpcClient {
    /// Validates the endpoint and prepares a client. No request is sent.
    pub fn dial(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).map_err(|err| Error::Config(format!("invalid rpc url {url:?}: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "unsupported rpc url scheme {:?} in {url}",
                url.scheme()
            )));
        }
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            url,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    async fn post<B: Serialize + ?Sized, R: serde::de::DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        kind: &'static str,
        body: &B,
    ) -> Result<R> {
        let start = Instant::now();
        let send = async {
            let response = self
                .http
                .post(self.url.clone())
                .headers(propagation_headers(ctx, || None))
                .json(body)
                .send()
                .await?
                .error_for_status()?;
            Ok::<R, Error>(response.json::<R>().await?)
        };
        let result = ctx.run(send).await;

        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!(RPC_REQUESTS_TOTAL, "kind" => kind, "outcome" => outcome).increment(1);
        histogram!(RPC_REQUEST_DURATION_SECONDS, "kind" => kind).record(start.elapsed().as_secs_f64());
        result
    }
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn call(&self, ctx: &RequestContext, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params: &params,
        };
        let response: Response = self.post(ctx, "single", &request).await?;
        response.into_result()
    }

    async fn batch_call(&self, ctx: &RequestContext, calls: &[RpcCall]) -> Result<Vec<Result<Value>>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let first_id = self
            .next_id
            .fetch_add(calls.len() as u64, Ordering::Relaxed);
        let requests: Vec<Request<'_>> = calls
            .iter()
            .zip(first_id..)
            .map(|(call, id)| Request {
                jsonrpc: JSONRPC_VERSION,
                id,
                method: call.method,
                params: &call.params,
            })
            .collect();

        let responses = match self.post(ctx, "batch", &requests).await? {
            BatchReply::Many(responses) => responses,
            BatchReply::One(response) => {
                // A lone object can only be an error about the batch itself.
                response.into_result()?;
                return Err(Error::Decode("batch answered with a single result".into()));
            }
        };

        let mut by_id: HashMap<u64, Response> = responses
            .into_iter()
            .filter_map(|response| response.id.as_u64().map(|id| (id, response)))
            .collect();

        Ok(requests
            .iter()
            .map(|request| match by_id.remove(&request.id) {
                Some(response) => response.into_result(),
                None => Err(Error::MissingResponse(request.id)),
            })
            .collect())
    }
}
