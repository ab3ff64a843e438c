//! SQL utilities for the datastore
//!
//! Identifier and literal escaping, query assembly, DDL generation and
//! inspection of passthrough SQL.

pub mod ddl;
pub mod introspect;
pub mod query;
pub mod sanitize;

pub use ddl::DdlGenerator;
pub use introspect::{ParsedSqlIntrospector, SqlIntrospector, SqlReferences};
pub use query::{Params, QueryParts};
pub use sanitize::{identifier, literal_string};
