pub mod cache;
pub mod conversation;
pub mod events;
pub mod features;
pub mod prompt;
pub mod recovery;
pub mod settings;
