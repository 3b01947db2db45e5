//! Built-in handlers, enough to drive a task through every status from the
//! command line.

use async_trait::async_trait;
use deferq_core::SchedulerBuilder;
use deferq_core::error::ExecutionError;
use deferq_core::typed::{Deferred, Handler, RegistryError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const FAIL_HANDLER: &str = "demo.fail.v1";

/// Returns `message` unchanged.
#[derive(Debug, Serialize, Deserialize)]
pub struct Echo {
    pub message: String,
}

impl Deferred for Echo {
    const NAME: &'static str = "demo.echo.v1";
}

pub struct EchoHandler;

#[async_trait]
impl Handler<Echo> for EchoHandler {
    async fn call(&self, args: Echo) -> Result<Value, ExecutionError> {
        Ok(Value::String(args.message))
    }
}

/// `x + base`; `base` defaults to 0.
#[derive(Debug, Serialize, Deserialize)]
pub struct Add {
    pub x: i64,
    #[serde(default)]
    pub base: i64,
}

impl Deferred for Add {
    const NAME: &'static str = "demo.add.v1";
}

pub struct AddHandler;

#[async_trait]
impl Handler<Add> for AddHandler {
    async fn call(&self, args: Add) -> Result<Value, ExecutionError> {
        args.x
            .checked_add(args.base)
            .map(|sum| json!(sum))
            .ok_or_else(|| ExecutionError::new(format!("{} + {} overflows", args.x, args.base)))
    }
}

/// Always fails, with `message` if one is given.
fn fail(args: Map<String, Value>) -> Result<Value, ExecutionError> {
    let message = args
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("intentional failure");
    Err(ExecutionError::new(message))
}

pub fn register_builtins(builder: SchedulerBuilder) -> Result<SchedulerBuilder, RegistryError> {
    builder
        .register::<Echo, _>(EchoHandler)?
        .register::<Add, _>(AddHandler)?
        .register_fn(FAIL_HANDLER, fail)
}
