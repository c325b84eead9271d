//! The email record exchanged by the sync engine and stored by ingestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single email message, either composed locally or materialized from a
/// downloaded or ingested MIME message.
///
/// Immutable once persisted, except for the `sent` flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    /// Stable local identity. See [`Email::compute_uid`].
    #[serde(default)]
    pub uid: String,

    /// When the message was written (the `Date:` header for inbound mail).
    pub sent_at: DateTime<Utc>,

    /// Sender address.
    pub from: String,

    /// Primary recipients, in header order.
    pub to: Vec<String>,

    #[serde(default)]
    pub cc: Vec<String>,

    #[serde(default)]
    pub bcc: Vec<String>,

    pub subject: String,

    /// HTML body when the message has one, otherwise plain text.
    pub body: String,

    #[serde(default)]
    pub attachments: Vec<Attachment>,

    /// Images referenced from the body by `cid:` that were not embedded yet.
    #[serde(default)]
    pub inline_images: Vec<InlineImage>,

    /// Key of the raw blob this email was ingested from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    /// Outbound status flag. `false` means the email is still pending upload.
    #[serde(default)]
    pub sent: bool,
}

/// A file attached to an email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,

    /// Decoded bytes. Serialized as standard base64.
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,

    /// MIME content type (e.g. `"image/jpeg"`, `"application/pdf"`).
    pub content_type: String,
}

/// An image embedded in the HTML body through a `cid:` reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineImage {
    /// Content-ID without the surrounding angle brackets.
    pub content_id: String,

    /// Declared filename, if any. Used when the image ends up as an attachment.
    #[serde(default)]
    pub filename: String,

    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,

    pub content_type: String,
}

impl Email {
    /// Build a new unsent email and assign its uid.
    pub fn new(
        from: impl Into<String>,
        to: Vec<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        let mut email = Self {
            uid: String::new(),
            sent_at,
            from: from.into(),
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.into(),
            body: body.into(),
            attachments: Vec::new(),
            inline_images: Vec::new(),
            resource_id: None,
            sent: false,
        };
        email.ensure_uid();
        email
    }

    /// Hex SHA-256 over the fields that identify a message.
    ///
    /// Two copies of the same message (e.g. downloaded twice) hash the same.
    pub fn compute_uid(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.from.as_bytes());
        for field in [&self.to, &self.cc, &self.bcc] {
            hasher.update([0u8]);
            for addr in field {
                hasher.update(addr.as_bytes());
                hasher.update(b",");
            }
        }
        hasher.update([0u8]);
        hasher.update(self.subject.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.sent_at.to_rfc3339().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.body.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Fill in `uid` if it is empty.
    pub fn ensure_uid(&mut self) {
        if self.uid.is_empty() {
            self.uid = self.compute_uid();
        }
    }

    /// All recipients (`to`, `cc`, `bcc`) in order.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
    }
}

/// Serde adapter storing binary content as standard base64 text.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
