pub mod audit;
pub mod auth;
pub mod backend;
pub mod backup;
pub mod batch;
pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod model;
pub mod mysql_backend;
pub mod record;
pub mod rollback;
pub mod sandbox;
pub mod schema;
pub mod server;
pub mod split;
pub mod stats;
pub mod store;

pub use backend::{Backend, Connector, ExecResult, RowSet, Session};
pub use config::{AuditRules, RunMode, SessionConfig, SourceOptions};
pub use engine::Engine;
pub use error::{InceptionError, RunFailure};
pub use model::{Finding, Opid, Record, Severity, Stage, RECORD_COLUMNS};
pub use mysql_backend::MysqlConnector;
pub use sandbox::SandboxConnector;
