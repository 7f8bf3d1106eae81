pub mod checkpoint;
pub mod db;
pub mod entities;
pub mod products;
pub mod raw_store;
pub mod recount;
pub mod relations;
