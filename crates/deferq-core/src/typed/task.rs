//! Deferred trait - 引数の型と Handler 名を結びつける

use serde::Serialize;
use serde::de::DeserializeOwned;

/// An argument struct that a registered handler knows how to run.
///
/// # Example
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendInvoice {
///     invoice_id: u64,
/// }
///
/// impl Deferred for SendInvoice {
///     const NAME: &'static str = "billing.send_invoice.v1";
/// }
/// ```
///
/// The name is what gets persisted, so it must stay stable across releases.
/// Bump the `vN` suffix instead of changing the shape of an existing type.
pub trait Deferred: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Naming convention: `{namespace}.{action}.v{major}`.
    const NAME: &'static str;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde::{Deserialize, Serialize};

    use super::Deferred;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Double {
        pub x: i64,
    }

    impl Deferred for Double {
        const NAME: &'static str = "test.double.v1";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AddBase {
        pub x: i64,
        pub base: i64,
    }

    impl Deferred for AddBase {
        const NAME: &'static str = "test.add_base.v1";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Explode {
        pub message: String,
    }

    impl Deferred for Explode {
        const NAME: &'static str = "test.explode.v1";
    }
}
