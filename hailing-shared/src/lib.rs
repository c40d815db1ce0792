pub mod models;
pub mod topics;
