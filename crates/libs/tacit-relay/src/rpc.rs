//! JSON-RPC 2.0 wire types for the relay protocol.

use std::time::{SystemTime, UNIX_EPOCH};

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tacit_store::{RequestId, SubscriptionId, Topic};

pub const JSONRPC_VERSION: &str = "2.0";

pub mod method {
    pub const PUBLISH: &str = "irn_publish";
    pub const SUBSCRIBE: &str = "irn_subscribe";
    pub const BATCH_SUBSCRIBE: &str = "irn_batchSubscribe";
    pub const UNSUBSCRIBE: &str = "irn_unsubscribe";
    pub const SUBSCRIPTION: &str = "irn_subscription";
    pub const PROPOSE_SESSION: &str = "wc_proposeSession";
    pub const APPROVE_SESSION: &str = "wc_approveSession";
}

/// 64-bit request id: millisecond timestamp scaled by 1000 plus random low
/// digits. Unique per client while outstanding.
pub fn generate_request_id() -> RequestId {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default();
    millis * 1000 + u64::from(OsRng.next_u32()) % 1000
}

// ── Frames ────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    pub params: JsonValue,
}

impl RpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: JsonValue) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_owned(), id, method: method.into(), params }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcResult {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: JsonValue,
}

impl RpcResult {
    pub fn new(id: RequestId, result: JsonValue) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_owned(), id, result }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub error: RpcErrorBody,
}

impl RpcErrorResponse {
    pub fn new(id: RequestId, error: RpcErrorBody) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_owned(), id, error }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

/// One inbound frame, parsed in triage order: request, then result, then
/// error. Anything else is reported as an internal error by the caller.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcPayload {
    Request(RpcRequest),
    Result(RpcResult),
    Error(RpcErrorResponse),
}

impl RpcPayload {
    pub fn parse(plaintext: &str) -> Option<Self> {
        if let Ok(request) = serde_json::from_str::<RpcRequest>(plaintext) {
            return Some(Self::Request(request));
        }
        if let Ok(result) = serde_json::from_str::<RpcResult>(plaintext) {
            return Some(Self::Result(result));
        }
        if let Ok(error) = serde_json::from_str::<RpcErrorResponse>(plaintext) {
            return Some(Self::Error(error));
        }
        None
    }
}

// ── Relay call params ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublishParams {
    pub topic: Topic,
    /// Base64 envelope.
    pub message: String,
    pub ttl: u64,
    pub tag: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<RequestId>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubscribeParams {
    pub topic: Topic,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BatchSubscribeParams {
    pub topics: Vec<Topic>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UnsubscribeParams {
    pub topic: Topic,
    pub id: SubscriptionId,
}

// ── Server push ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionPush {
    pub id: SubscriptionId,
    pub data: SubscriptionData,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionData {
    pub topic: Topic,
    /// Base64 envelope.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<u32>,
}
