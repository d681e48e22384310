pub mod audit;
pub mod credentials;
pub mod sessions;
pub mod store;

pub use audit::SqliteAuditSink;
pub use credentials::SqliteCredentialVerifier;
pub use sessions::SqliteSessionStore;
pub use store::DbStore;
