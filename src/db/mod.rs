//! Database module for the PostgreSQL warehouse connection

pub mod connection;

pub use connection::init_pool;
