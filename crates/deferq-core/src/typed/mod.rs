//! Typed - 名前付き Handler と payload codec
//!
//! # 2 層構造
//! - **Typed**: `Deferred` trait, `Handler<T>` trait - 引数構造体をコンパイル時に検査
//! - **Dyn**: `DynHandler` trait - object-safe, registry が保持する形
//!
//! 永続化されたタスクは Handler 名を持つ。`PayloadCodec` がその名前を
//! `HandlerRegistry` で解決し、保存された引数を束縛する。

pub mod codec;
pub mod handler;
pub mod registry;
pub mod task;

pub use self::codec::{DecodedCall, PAYLOAD_VERSION, Payload, PayloadCodec};
pub use self::handler::{DynHandler, FnHandler, Handler, TypedHandler};
pub use self::registry::{HandlerRegistry, RegistryError};
pub use self::task::Deferred;
