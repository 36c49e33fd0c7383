pub mod customer;
pub mod equipment;
pub mod invoice;
pub mod job;
pub mod membership;
pub mod organization;
pub mod quote;
pub mod user;

pub use customer::Customer;
pub use equipment::Equipment;
pub use invoice::Invoice;
pub use job::Job;
pub use membership::Membership;
pub use organization::Organization;
pub use quote::Quote;
pub use user::User;
