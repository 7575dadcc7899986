//! Upstream credentials: records, health state, and the shared pool.

pub mod credential;
pub mod pool;

pub use credential::{
    normalize_secret, preview_secret, Credential, CredentialState, FailureClass, Tier,
};
pub use pool::{
    BatchAddReport, CredentialLease, CredentialPool, NoAvailableCredential, PoolConfig, PoolError,
    PoolStats,
};
