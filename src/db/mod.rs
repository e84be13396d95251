pub mod connection;
pub mod models;

pub use connection::{record_foreground_events, DbHandler};
