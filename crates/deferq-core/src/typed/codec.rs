//! PayloadCodec - 遅延呼び出し <-> 保存用 JSON ドキュメント
//!
//! 保存形式:
//! ```json
//! { "version": 1, "handler": "billing.send_invoice.v1",
//!   "context": { "invoice_id": 7 }, "defaults": { "retry_url": null } }
//! ```
//!
//! 行は書き込んだのとは別のプロセスや新しいビルドで decode されうる:
//! - `version` がなければ 1 として読む
//! - 未知のフィールドは無視
//! - [`PAYLOAD_VERSION`] より新しい version だけを拒否
//!
//! Handler は [`HandlerRegistry`] から名前で引く。payload がコードを運ぶことはない。
//!
//! # 学習ポイント
//! - `#[serde(default)]` による前方互換
//! - `serde_json::Map` のマージ（params > defaults > context）

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::handler::DynHandler;
use super::registry::HandlerRegistry;
use crate::error::{DecodeError, EncodeError, ExecutionError};

pub const PAYLOAD_VERSION: u32 = 1;

const MAX_HANDLER_NAME_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default = "first_version")]
    pub version: u32,
    pub handler: String,
    /// Values the call captured when it was enqueued.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Parameter defaults, applied over `context`.
    #[serde(default)]
    pub defaults: Map<String, Value>,
}

fn first_version() -> u32 {
    1
}

impl Payload {
    pub fn to_value(&self) -> Value {
        // A struct of strings, integers and maps always serializes.
        serde_json::json!({
            "version": self.version,
            "handler": self.handler,
            "context": self.context,
            "defaults": self.defaults,
        })
    }
}

pub struct PayloadCodec;

impl PayloadCodec {
    /// Build a payload for `handler`.
    ///
    /// `context` and `defaults` must serialize to JSON objects; `()` or any
    /// other value serializing to `null` counts as empty.
    pub fn encode<C, D>(handler: &str, context: &C, defaults: &D) -> Result<Payload, EncodeError>
    where
        C: Serialize + ?Sized,
        D: Serialize + ?Sized,
    {
        validate_handler_name(handler)?;
        Ok(Payload {
            version: PAYLOAD_VERSION,
            handler: handler.to_string(),
            context: to_object("context", context)?,
            defaults: to_object("defaults", defaults)?,
        })
    }

    /// Parse a stored document and resolve its handler.
    pub fn decode(value: &Value, registry: &HandlerRegistry) -> Result<DecodedCall, DecodeError> {
        let payload: Payload = serde_json::from_value(value.clone())
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        if payload.version > PAYLOAD_VERSION {
            return Err(DecodeError::UnsupportedVersion {
                found: payload.version,
                supported: PAYLOAD_VERSION,
            });
        }
        if validate_handler_name(&payload.handler).is_err() {
            return Err(DecodeError::Malformed(format!(
                "invalid handler name {:?}",
                payload.handler
            )));
        }
        let handler = registry
            .get(&payload.handler)
            .ok_or_else(|| DecodeError::UnknownHandler(payload.handler.clone()))?;
        Ok(DecodedCall { handler, payload })
    }
}

/// A payload bound to its handler, ready to run.
pub struct DecodedCall {
    handler: Arc<dyn DynHandler>,
    payload: Payload,
}

impl DecodedCall {
    pub fn handler_name(&self) -> &str {
        &self.payload.handler
    }

    pub fn handler(&self) -> Arc<dyn DynHandler> {
        Arc::clone(&self.handler)
    }

    /// `params` over `defaults` over `context`.
    pub fn arguments(&self, params: &Map<String, Value>) -> Map<String, Value> {
        let mut args = self.payload.context.clone();
        for (k, v) in &self.payload.defaults {
            args.insert(k.clone(), v.clone());
        }
        for (k, v) in params {
            args.insert(k.clone(), v.clone());
        }
        args
    }

    pub async fn invoke(&self, params: &Map<String, Value>) -> Result<Value, ExecutionError> {
        self.handler.call_dyn(self.arguments(params)).await
    }
}

fn validate_handler_name(name: &str) -> Result<(), EncodeError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_HANDLER_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'));
    if valid {
        Ok(())
    } else {
        Err(EncodeError::InvalidHandlerName(name.to_string()))
    }
}

fn to_object<T: Serialize + ?Sized>(
    field: &'static str,
    value: &T,
) -> Result<Map<String, Value>, EncodeError> {
    match serde_json::to_value(value).map_err(|source| EncodeError::Serialize { field, source })? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(EncodeError::NotAnObject {
            field,
            found: json_kind(&other).to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
