mod feeds;
mod filters;
mod outputs;
mod schema;
mod seen;
mod types;

pub use schema::Database;
pub use types::DatabaseError;
