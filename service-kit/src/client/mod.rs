//! Client configurations and the clients they build.

pub mod eth;
pub mod grpc;
pub mod http;
pub mod redis;

pub use self::eth::{BatchableEthCfg, BatchableEthClient, CallMsg, EthCfg, EthClient};
pub use self::grpc::{GrpcCfg, GrpcChannel, MetadataInterceptor};
pub use self::http::{HttpCfg, HttpClient};
pub use self::redis::{RedisCfg, ReconnectableRedis, Topology};
