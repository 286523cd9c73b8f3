pub mod conversation;
pub mod errors;
pub mod events;
pub mod identity;
pub mod ids;
pub mod message;
pub mod provider;
pub mod tools;
