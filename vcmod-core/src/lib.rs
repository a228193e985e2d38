//! vcmod-core: declarative reconciliation engine for vSphere modules.
//!
//! A module declares its parameters and the endpoints it needs; the engine
//! validates the input, opens the sessions, hands the module a
//! [`Context`], and turns whatever happens into exactly one exit envelope.
//!
//! # Example
//! ```ignore
//! use vcmod_core::{FileConfig, HttpConnector, execute, process_env};
//!
//! let envelope = execute(&module, input, &HttpConnector::new(), &FileConfig::default(), &process_env).await;
//! println!("{envelope}");
//! ```

pub mod api;
pub mod args;
pub mod audit;
pub mod builders;
pub mod compat;
pub mod config;
pub mod context;
pub mod diff;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod http;
pub mod inventory;
pub mod mob;
pub mod module;
pub mod reconcile;
pub mod redact;
pub mod rest;
pub mod session;
pub mod soap;
pub mod task;
pub mod transfer;
pub mod value;

pub use api::{
    Args, FileTransfer, GlobalPermission, GlobalPermissionApi, Method, ObjectContent, RestApi,
    RetrieveSpec, Selection, ServiceContent, VimApi,
};
pub use args::{ArgType, ArgumentSpec, Param, Params};
pub use audit::{AuditLogger, Surface};
pub use config::{FileConfig, process_env};
pub use context::Context;
pub use diff::{CompareRules, Diff};
pub use engine::execute;
pub use envelope::ExitEnvelope;
pub use error::{Error, ErrorKind, Fault, Result};
pub use inventory::{By, NameMatch, Resolver, Scope};
pub use module::{Module, Outcome};
pub use reconcile::{Decision, Reconciled, Resource, State, converge, reconcile};
pub use session::{Connector, ConnectionParams, Endpoints, HttpConnector, Needs, Session, Teardown};
pub use value::{Handle, Kind, MoRef, ValueExt};
