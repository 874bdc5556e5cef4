//! Structural utilities over event data: flattening to dotted keys, deep
//! merging with the `[*]` array wildcard, and query-string rendering.

mod flatten;
mod merge;
mod url;

pub use flatten::flatten;
pub use merge::{merge, WILDCARD_SUFFIX};
pub use url::query_string;
