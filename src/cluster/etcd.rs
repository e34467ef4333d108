//! etcd v3 client over gRPC.
//!
//! Only the three KV calls the coordinator needs are declared: `Put`, `Range`
//! and `DeleteRange`. Messages carry the field numbers of etcd's
//! `rpc.proto`; unused fields are left out and skipped on decode.
//!
//! Every configured endpoint gets a lazily connected channel. A failed call
//! moves on to the next endpoint, and the last endpoint that answered is
//! tried first next time.

use super::service::CoordinationService;
use crate::storage::prefix_successor;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

const PUT: &str = "/etcdserverpb.KV/Put";
const RANGE: &str = "/etcdserverpb.KV/Range";
const DELETE_RANGE: &str = "/etcdserverpb.KV/DeleteRange";

#[derive(Clone, PartialEq, prost::Message)]
pub struct ResponseHeader {
    #[prost(uint64, tag = "1")]
    pub cluster_id: u64,
    #[prost(uint64, tag = "2")]
    pub member_id: u64,
    #[prost(int64, tag = "3")]
    pub revision: i64,
    #[prost(uint64, tag = "4")]
    pub raft_term: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyValue {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(int64, tag = "2")]
    pub create_revision: i64,
    #[prost(int64, tag = "3")]
    pub mod_revision: i64,
    #[prost(int64, tag = "4")]
    pub version: i64,
    #[prost(bytes = "vec", tag = "5")]
    pub value: Vec<u8>,
    #[prost(int64, tag = "6")]
    pub lease: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PutRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub lease: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PutResponse {
    #[prost(message, optional, tag = "1")]
    pub header: Option<ResponseHeader>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RangeRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub range_end: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub limit: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RangeResponse {
    #[prost(message, optional, tag = "1")]
    pub header: Option<ResponseHeader>,
    #[prost(message, repeated, tag = "2")]
    pub kvs: Vec<KeyValue>,
    #[prost(bool, tag = "3")]
    pub more: bool,
    #[prost(int64, tag = "4")]
    pub count: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteRangeRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub range_end: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteRangeResponse {
    #[prost(message, optional, tag = "1")]
    pub header: Option<ResponseHeader>,
    #[prost(int64, tag = "2")]
    pub deleted: i64,
}

/// `range_end` selecting every key with `prefix`. etcd reads `[0]` as
/// "no upper bound".
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    prefix_successor(prefix).unwrap_or_else(|| vec![0])
}

/// Add a scheme to bare `host:port` endpoints.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

/// etcd-backed [`CoordinationService`].
pub struct EtcdCoordination {
    endpoints: Vec<(String, Channel)>,
    preferred: AtomicUsize,
}

impl std::fmt::Debug for EtcdCoordination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let urls: Vec<&str> = self.endpoints.iter().map(|(url, _)| url.as_str()).collect();
        f.debug_struct("EtcdCoordination")
            .field("endpoints", &urls)
            .finish_non_exhaustive()
    }
}

impl EtcdCoordination {
    /// Prepare channels for `endpoints`. No connection is made until the
    /// first request. Must be called inside a tokio runtime.
    pub fn connect(endpoints: &[String], timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            anyhow::bail!("no etcd endpoints configured");
        }
        let endpoints = endpoints
            .iter()
            .map(|raw| {
                let url = normalize_endpoint(raw);
                let channel = Endpoint::from_shared(url.clone())
                    .with_context(|| format!("invalid etcd endpoint {}", raw))?
                    .connect_timeout(timeout)
                    .timeout(timeout)
                    .connect_lazy();
                Ok((url, channel))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(endpoints = endpoints.len(), "configured etcd coordination");
        Ok(Self {
            endpoints,
            preferred: AtomicUsize::new(0),
        })
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp>
    where
        Req: prost::Message + Clone + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let count = self.endpoints.len();
        let start = self.preferred.load(Ordering::Relaxed);
        let mut last_error = None;

        for attempt in 0..count {
            let index = (start + attempt) % count;
            let (url, channel) = &self.endpoints[index];
            match Self::unary_on(channel.clone(), path, request.clone()).await {
                Ok(response) => {
                    self.preferred.store(index, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(err) => {
                    tracing::debug!(endpoint = %url, method = path, error = %err, "etcd call failed");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("no etcd endpoints configured")))
    }

    async fn unary_on<Req, Resp>(channel: Channel, path: &'static str, request: Req) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready().await.context("etcd endpoint not ready")?;
        let codec = tonic::codec::ProstCodec::<Req, Resp>::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                codec,
            )
            .await
            .with_context(|| format!("etcd call {} failed", path))?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl CoordinationService for EtcdCoordination {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let request = PutRequest {
            key: key.as_bytes().to_vec(),
            value,
            lease: 0,
        };
        let _: PutResponse = self.unary(PUT, request).await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let request = RangeRequest {
            key: prefix.as_bytes().to_vec(),
            range_end: prefix_range_end(prefix.as_bytes()),
            limit: 0,
        };
        let response: RangeResponse = self.unary(RANGE, request).await?;
        response
            .kvs
            .into_iter()
            .map(|kv| {
                let key = String::from_utf8(kv.key).context("etcd key is not UTF-8")?;
                Ok((key, kv.value))
            })
            .collect()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let request = DeleteRangeRequest {
            key: key.as_bytes().to_vec(),
            range_end: Vec::new(),
        };
        let _: DeleteRangeResponse = self.unary(DELETE_RANGE, request).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        let urls: Vec<&str> = self.endpoints.iter().map(|(url, _)| url.as_str()).collect();
        format!("etcd({})", urls.join(","))
    }
}
