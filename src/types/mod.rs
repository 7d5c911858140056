pub mod contact;
pub mod events;
pub mod message;
pub mod session;
