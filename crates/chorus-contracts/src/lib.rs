pub mod analysis;
pub mod chat;
pub mod config;
pub mod conversation;
pub mod events;
pub mod features;
pub mod ids;
pub mod models;
pub mod session;
pub mod similarity;
pub mod stream;
