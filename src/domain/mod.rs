pub mod auth;
pub mod clock;
pub mod conversation;
pub mod event;
pub mod message;
