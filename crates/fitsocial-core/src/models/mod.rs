//! Payload types carried through the gateway.
//!
//! The client does not interpret these beyond decoding them for display.

pub mod chat;
pub mod feed;

pub use chat::{ChatMessage, NewChatMessage};
pub use feed::{Comment, Like, NewComment, NewPost, Post, PostChanges, UploadedFile, NO_IMAGE};
