//! # replica-core — Operation log data model
//!
//! Pure, I/O-free building blocks shared by clients and servers.
//!
//! ## Modules
//!
//! - [`op`] — Immutable timestamped operations and the writer clock
//! - [`doc`] — Per-document op log, fold to state, distillation, delta selection
//! - [`version`] — `source → latest date` version vectors
//! - [`diff`] — String, array and id-list edit scripts
//! - [`query`] — Filter/sort/aggregate query evaluation
//! - [`projection`] — Field-restricted views over a base collection
//! - [`value`] — Dot-path access into JSON values
//!
//! ## Example
//!
//! ```
//! use replica_core::{Document, OpKind, Operation};
//! use serde_json::json;
//!
//! let mut doc = Document::new("users", "1");
//! doc.apply_op(Operation::new(OpKind::Add, "a", 1, "users", "1").with_value(json!({"name": "Ivan"})));
//! doc.apply_op(Operation::new(OpKind::Set, "b", 2, "users", "1").with_field("name").with_value(json!("Petr")));
//! assert_eq!(doc.get(), Some(json!({"_id": "1", "name": "Petr"})));
//! ```

pub mod diff;
pub mod doc;
pub mod op;
pub mod projection;
pub mod query;
pub mod value;
pub mod version;

// Re-exports for convenience
pub use diff::{apply_id_diffs, array_edits, diff_ids, string_edits, ArrayEdit, IdDiff, StringEdit};
pub use doc::{Document, ID_FIELD};
pub use op::{new_source_id, now_ms, Clock, OpKind, Operation};
pub use projection::{FieldSpec, Projection, ProjectionError};
pub use query::{evaluate, query_hash, JoinRef, QueryKind, QueryOutput};
pub use version::{VersionParseError, VersionVector};
