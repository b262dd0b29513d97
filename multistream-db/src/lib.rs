pub mod db;
pub mod migrations;
pub mod stream;

pub use db::{DatabaseConfig, StreamDatabase};
