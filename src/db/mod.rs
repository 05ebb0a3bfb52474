pub mod models;
pub mod pg_store;
pub mod queries;
