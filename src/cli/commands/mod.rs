pub mod fixture;
pub mod policy;
pub mod verify;
