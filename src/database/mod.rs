pub mod binding;
pub mod fixture;
pub mod manager;
pub mod models;
pub mod policy;
pub mod scoped;
