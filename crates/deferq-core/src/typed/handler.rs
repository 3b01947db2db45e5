//! Handler trait - 名前付き Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> / FnHandler<F> → DynHandler)
//! - 同期クロージャを `spawn_blocking` で async に載せる

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::task::Deferred;
use crate::error::ExecutionError;

/// Runs a deferred call whose arguments decode into `T`.
///
/// The returned value is stored as the task's output: strings verbatim,
/// `null` as no output, anything else as compact JSON.
#[async_trait]
pub trait Handler<T: Deferred>: Send + Sync {
    async fn call(&self, args: T) -> Result<Value, ExecutionError>;
}

/// Object-safe handler taking the merged argument map.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn call_dyn(&self, args: Map<String, Value>) -> Result<Value, ExecutionError>;
    fn name(&self) -> &str;
}

pub struct TypedHandler<T: Deferred, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Deferred, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Deferred, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn call_dyn(&self, args: Map<String, Value>) -> Result<Value, ExecutionError> {
        let args: T = serde_json::from_value(Value::Object(args))
            .map_err(|e| ExecutionError::InvalidArguments(e.to_string()))?;
        self.handler.call(args).await
    }

    fn name(&self) -> &str {
        T::NAME
    }
}

/// Handler backed by a plain function over the argument map.
///
/// The function runs on tokio's blocking pool, so a slow or blocking body
/// never holds up an async worker thread and the executor's timeout still
/// fires on time.
pub struct FnHandler<F> {
    name: String,
    f: Arc<F>,
}

impl<F> FnHandler<F>
where
    F: Fn(Map<String, Value>) -> Result<Value, ExecutionError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

#[async_trait]
impl<F> DynHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>) -> Result<Value, ExecutionError> + Send + Sync + 'static,
{
    async fn call_dyn(&self, args: Map<String, Value>) -> Result<Value, ExecutionError> {
        let f = Arc::clone(&self.f);
        match tokio::task::spawn_blocking(move || f(args)).await {
            Ok(result) => result,
            // keep the panic payload so the executor reports it as a panic
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(ExecutionError::new(format!("{}: {e}", self.name))),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::DoubleHandler;
    use super::*;
    use crate::typed::task::fixtures::Double;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_arguments() {
        let handler = TypedHandler::<Double, _>::new(DoubleHandler);
        let out = handler.call_dyn(map(json!({ "x": 21 }))).await.unwrap();
        assert_eq!(out, json!(42));
        assert_eq!(handler.name(), Double::NAME);
    }

    #[tokio::test]
    async fn typed_handler_reports_argument_mismatch() {
        let handler = TypedHandler::<Double, _>::new(DoubleHandler);
        let err = handler
            .call_dyn(map(json!({ "x": "not a number" })))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn fn_handler_sees_raw_map() {
        let handler = FnHandler::new("test.keys.v1", |args: Map<String, Value>| {
            Ok(json!(args.len()))
        });
        let out = handler
            .call_dyn(map(json!({ "a": 1, "b": 2 })))
            .await
            .unwrap();
        assert_eq!(out, json!(2));
        assert_eq!(handler.name(), "test.keys.v1");
    }

    #[tokio::test]
    async fn fn_handler_runs_off_the_async_thread() {
        let caller = std::thread::current().id();
        let handler = FnHandler::new("test.thread.v1", move |_| {
            Ok(json!(std::thread::current().id() != caller))
        });
        let out = handler.call_dyn(Map::new()).await.unwrap();
        assert_eq!(out, json!(true));
    }
}
