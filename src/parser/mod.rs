//! Email parsing: MIME decoding and normalization of inbound messages.

pub mod mime;
