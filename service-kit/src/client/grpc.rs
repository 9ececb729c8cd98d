//! Hot-reloadable gRPC channel.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Deserialize;
use tonic::{
    Request, Status,
    codegen::InterceptedService,
    metadata::{AsciiMetadataKey, AsciiMetadataValue},
    service::Interceptor,
    transport::{Channel, Endpoint},
};

use crate::{
    config::{CLIENT_CLOSE_DELAY, Reloadable},
    error::{Error, Result},
    observability::CLIENT_ID_HEADER,
    reconnect::release_later,
};

/// Channel that stamps the configured metadata on every call. Generated tonic
/// clients accept it through their `new` constructor.
pub type GrpcChannel = InterceptedService<Channel, MetadataInterceptor>;

/// Adds fixed metadata entries to outgoing requests.
#[derive(Clone, Debug, Default)]
pub struct MetadataInterceptor {
    entries: Arc<Vec<(AsciiMetadataKey, AsciiMetadataValue)>>,
}

impl MetadataInterceptor {
    pub fn new(headers: &HashMap<String, String>) -> Result<Self> {
        let entries = headers
            .iter()
            .map(|(name, value)| {
                let key = AsciiMetadataKey::from_bytes(name.as_bytes())
                    .map_err(|err| Error::Config(format!("invalid metadata key {name:?}: {err}")))?;
                let value = AsciiMetadataValue::try_from(value.as_str())
                    .map_err(|err| Error::Config(format!("invalid value for metadata {name}: {err}")))?;
                Ok((key, value))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            entries: Arc::new(entries),
        })
    }
}

impl Interceptor for MetadataInterceptor {
    fn call(&mut self, mut request: Request<()>) -> std::result::Result<Request<()>, Status> {
        for (key, value) in self.entries.iter() {
            request.metadata_mut().insert(key.clone(), value.clone());
        }
        Ok(request)
    }
}

#[derive(Clone, Deserialize)]
pub struct GrpcCfg {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-call deadline. Zero disables it.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Sent as `x-client-id`. Defaults to the host name.
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(skip)]
    channel: Option<Arc<GrpcChannel>>,
}

fn default_base_url() -> String {
    "http://localhost:9080".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl Default for GrpcCfg {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_ms: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            client_id: String::new(),
            headers: HashMap::new(),
            channel: None,
        }
    }
}

impl std::fmt::Debug for GrpcCfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcCfg")
            .field("base_url", &self.base_url)
            .field("timeout_ms", &self.timeout_ms)
            .field("client_id", &self.client_id)
            .field("connected", &self.channel.is_some())
            .finish_non_exhaustive()
    }
}

impl GrpcCfg {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// The channel built by the last update, if building it succeeded.
    pub fn channel(&self) -> Option<GrpcChannel> {
        self.channel.as_deref().cloned()
    }

    /// Wraps the current channel in a generated client, e.g.
    /// `cfg.client(PriceServiceClient::new)`.
    pub fn client<C>(&self, factory: impl FnOnce(GrpcChannel) -> C) -> Option<C> {
        self.channel().map(factory)
    }

    /// Metadata sent with every call.
    pub fn request_headers(&self) -> HashMap<String, String> {
        let mut headers = self.headers.clone();
        if !self.client_id.is_empty() {
            headers.insert(CLIENT_ID_HEADER.to_string(), self.client_id.clone());
        }
        if headers.get(CLIENT_ID_HEADER).is_none_or(|id| id.is_empty())
            && let Ok(host) = std::env::var("HOSTNAME")
        {
            headers.insert(CLIENT_ID_HEADER.to_string(), host);
        }
        headers
    }

    /// Builds a lazily connecting channel. Must be called within a Tokio runtime.
    pub fn build(&self) -> Result<GrpcChannel> {
        let mut endpoint = Endpoint::from_shared(self.base_url.clone())
            .map_err(|err| Error::Config(format!("invalid grpc url {:?}: {err}", self.base_url)))?
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms));
        if self.timeout_ms > 0 {
            endpoint = endpoint.timeout(Duration::from_millis(self.timeout_ms));
        }
        let interceptor = MetadataInterceptor::new(&self.request_headers())?;
        Ok(InterceptedService::new(endpoint.connect_lazy(), interceptor))
    }
}

impl Reloadable for GrpcCfg {
    fn on_update(old: Option<&Self>, new: &mut Self) {
        if let Some(channel) = old.and_then(|old| old.channel.clone()) {
            release_later(channel, CLIENT_CLOSE_DELAY, "grpc".to_string());
        }
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::error!(base_url = %new.base_url, "grpc channel needs a tokio runtime");
            new.channel = None;
            return;
        }
        new.channel = match new.build() {
            Ok(channel) => Some(Arc::new(channel)),
            Err(err) => {
                tracing::error!(error = %err, "failed to build grpc channel");
                None
            }
        };
    }
}
