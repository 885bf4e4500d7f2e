mod collection;
mod errors;
mod id;

pub use collection::{ensure_indexes_exist, Coll, MongoCollection};
pub use errors::{is_duplicate_key_error, is_transient_error, is_unknown_commit_result};
pub use id::{ApiId, Id};
