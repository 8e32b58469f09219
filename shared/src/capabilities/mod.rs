//! Interfaces to everything outside the core. Shells (or tests) supply the
//! implementations; the core only sees these traits.

mod backend;
mod http;
mod kv;
mod notifier;
mod rest;
mod session;
mod storage;

use std::sync::Arc;

pub use self::backend::ThreadBackend;
pub use self::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpTransport, ValidatedUrl,
};
#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKvStore;
pub use self::kv::{
    KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKvStore, StorageErrorCode, TypedKv,
};
pub use self::notifier::Notifier;
pub use self::rest::RestBackend;
pub use self::session::{Session, SessionProvider, SignOutScope};
pub use self::storage::{
    clamp_signed_url_ttl, sanitize_file_name, ObjectStorage, StoragePath, StorageScope,
};

/// The collaborators a thread synchronizer needs, constructed once by the shell.
#[derive(Clone)]
pub struct Capabilities {
    pub backend: Arc<dyn ThreadBackend>,
    pub storage: Arc<dyn ObjectStorage>,
    pub notifier: Arc<dyn Notifier>,
    pub kv: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}
