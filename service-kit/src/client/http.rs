//! Hot-reloadable HTTP client.

use std::{collections::HashMap, time::Duration};

use reqwest::{
    Client, Method, RequestBuilder, Url,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use serde::Deserialize;
use tokio::time::Instant;

use crate::{
    config::Reloadable,
    context::RequestContext,
    error::{Error, Result},
    observability::{CLIENT_ID_HEADER, propagation_headers},
};

/// `reqwest` client with default headers and an optional base URL.
#[derive(Clone, Debug)]
pub struct HttpClient {
    http: Client,
    base_url: Option<Url>,
}

impl HttpClient {
    pub fn inner(&self) -> &Client {
        &self.http
    }

    /// Starts a request on behalf of `ctx`.
    ///
    /// `url` is resolved against the base URL when one is configured. The
    /// request carries the context's request id (a fresh one when the context
    /// has none) and its timeout is capped by the context deadline.
    pub fn request(&self, ctx: &RequestContext, method: Method, url: &str) -> Result<RequestBuilder> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let url = match &self.base_url {
            Some(base) => base.join(url),
            None => Url::parse(url),
        }
        .map_err(|err| Error::Config(format!("invalid request url {url:?}: {err}")))?;

        let headers = propagation_headers(ctx, || Some(uuid::Uuid::new_v4().to_string()));
        let mut request = self.http.request(method, url).headers(headers);
        if let Some(deadline) = ctx.deadline() {
            request = request.timeout(deadline.saturating_duration_since(Instant::now()));
        }
        Ok(request)
    }

    pub fn get(&self, ctx: &RequestContext, url: &str) -> Result<RequestBuilder> {
        self.request(ctx, Method::GET, url)
    }

    pub fn post(&self, ctx: &RequestContext, url: &str) -> Result<RequestBuilder> {
        self.request(ctx, Method::POST, url)
    }
}

#[derive(Clone, Deserialize)]
pub struct HttpCfg {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Sent as `x-client-id` on every request when not empty.
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(skip)]
    client: Option<HttpClient>,
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_ms: default_timeout_ms(),
            client_id: String::new(),
            headers: HashMap::new(),
            client: None,
        }
    }
}

impl std::fmt::Debug for HttpCfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCfg")
            .field("base_url", &self.base_url)
            .field("timeout_ms", &self.timeout_ms)
            .field("client_id", &self.client_id)
            .field("connected", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpCfg {
    pub fn client(&self) -> Option<&HttpClient> {
        self.client.as_ref()
    }

    pub fn build(&self) -> Result<HttpClient> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| Error::Config(format!("invalid header name {name:?}: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| Error::Config(format!("invalid value for header {name}: {err}")))?;
            headers.insert(name, value);
        }
        if !self.client_id.is_empty() {
            let value = HeaderValue::from_str(&self.client_id)
                .map_err(|err| Error::Config(format!("invalid client id: {err}")))?;
            headers.insert(CLIENT_ID_HEADER, value);
        }

        let base_url = match self.base_url.as_str() {
            "" => None,
            url => Some(
                Url::parse(url).map_err(|err| Error::Config(format!("invalid base url {url:?}: {err}")))?,
            ),
        };

        let http = Client::builder()
            .timeout(Duration::from_millis(self.timeout_ms))
            .default_headers(headers)
            .build()?;
        Ok(HttpClient { http, base_url })
    }
}

impl Reloadable for HttpCfg {
    fn on_update(_old: Option<&Self>, new: &mut Self) {
        new.client = match new.build() {
            Ok(client) => Some(client),
            Err(err) => {
                tracing::error!(error = %err, "failed to build http client");
                None
            }
        };
    }
}
