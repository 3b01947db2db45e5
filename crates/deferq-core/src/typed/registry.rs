//! HandlerRegistry - 名前付き Handler のプロセス全体テーブル
//!
//! payload の decode はここで Handler 名を解決する。このテーブルにないものは
//! 呼び出せないので、保存された payload はデータであってコードではない。
//!
//! 初期化中に構築し（mutable）、以後は `Arc` 越しに読み取り専用で共有する。
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::handler::{DynHandler, FnHandler, Handler, TypedHandler};
use super::task::Deferred;
use crate::error::ExecutionError;

/// HandlerRegistry は Handler 名 → `DynHandler` の対応表
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<T: Deferred, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.insert(Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    /// Register a handler without a typed argument struct.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> Result<(), RegistryError>
    where
        F: Fn(Map<String, Value>) -> Result<Value, ExecutionError> + Send + Sync + 'static,
    {
        self.insert(Arc::new(FnHandler::new(name, f)))
    }

    pub fn register_dyn(&mut self, handler: Arc<dyn DynHandler>) -> Result<(), RegistryError> {
        self.insert(handler)
    }

    fn insert(&mut self, handler: Arc<dyn DynHandler>) -> Result<(), RegistryError> {
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
