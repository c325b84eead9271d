//! Core data model types: emails, attachments, and users.

pub mod email;
pub mod user;

pub use email::{Attachment, Email, InlineImage};
pub use user::User;
