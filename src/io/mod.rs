//! I/O: object store construction and dataset access.

mod datasets;
mod store;

pub use datasets::{length_key, Datasets, Record, LENGTH_SUFFIX};
pub use store::{create_object_store, object_key, parse_s3_uri};
