//! WordPress migration and backup-restore engine.
//!
//! Archives from the supported backup plugins are recognized by
//! [`registry::AdapterRegistry`], unpacked safely and imported; a local
//! installation can also be pushed to a remote host. Every destructive run
//! snapshots the destination first and is rolled back on failure.

pub mod adapters;
pub mod archive;
pub mod command;
pub mod config;
pub mod content_locator;
pub mod error;
pub mod guard;
pub mod inventory;
pub mod ledger;
pub mod orchestrator;
pub mod path_safety;
pub mod preflight;
pub mod registry;
pub mod run;
pub mod site;
pub mod sniff;
pub mod sql_consolidator;
pub mod table_prefix;
pub mod url_alignment;
pub mod wp;

pub use config::{Mode, Options, Settings};
pub use error::{MigrateError, Result};
pub use guard::InterruptLatch;
pub use orchestrator::{execute, Orchestrator, Outcome};
