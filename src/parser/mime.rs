//! MIME message parsing: headers, body selection, attachment and inline-image
//! normalization.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use mail_parser::{Address, MessageParser, MimeHeaders, PartType};

use crate::error::{RelayError, Result};
use crate::model::{Attachment, Email, InlineImage};

/// Fallback content type when a part does not declare one.
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Parse raw MIME text into a structured [`Email`] keyed by `resource_id`.
///
/// The body is the HTML part when the message has one, otherwise the plain
/// text part. Parts carrying a Content-ID with an `image/*` type become
/// [`InlineImage`]s; every other non-body part is an [`Attachment`].
pub fn parse_mime_email(raw: &str, resource_id: &str) -> Result<Email> {
    let parse_error = |reason: &str| RelayError::Parse {
        resource_id: resource_id.to_string(),
        reason: reason.to_string(),
    };

    let message_bytes = skip_from_line(raw.as_bytes());
    if message_bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(parse_error("empty message"));
    }

    let msg = MessageParser::default()
        .parse(message_bytes)
        .ok_or_else(|| parse_error("not a MIME message"))?;

    let from = msg
        .from()
        .and_then(|addr| address_list(addr).into_iter().next())
        .ok_or_else(|| parse_error("missing From header"))?;

    let to = msg.to().map(address_list).unwrap_or_default();
    let cc = msg.cc().map(address_list).unwrap_or_default();
    let bcc = msg.bcc().map(address_list).unwrap_or_default();

    let subject = msg.subject().unwrap_or_default().to_string();

    let sent_at = msg
        .date()
        .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let html = msg
        .html_body
        .iter()
        .filter_map(|&idx| msg.part(idx))
        .find_map(|part| match &part.body {
            PartType::Html(html) => Some(html.to_string()),
            _ => None,
        });
    let body = html
        .or_else(|| msg.body_text(0).map(|s| s.into_owned()))
        .unwrap_or_default();

    let mut attachments = Vec::new();
    let mut inline_images = Vec::new();

    for part in msg.attachments() {
        let content_type = part
            .content_type()
            .map(|ct: &mail_parser::ContentType| {
                let main = ct.ctype();
                match ct.subtype() {
                    Some(sub) => format!("{main}/{sub}"),
                    None => main.to_string(),
                }
            })
            .unwrap_or_default()
            .to_lowercase();

        let content_id = part.content_id().map(strip_angle_brackets);

        match content_id {
            Some(content_id) if content_type.starts_with("image/") => {
                inline_images.push(InlineImage {
                    content_id,
                    filename: part.attachment_name().unwrap_or_default().to_string(),
                    content: part.contents().to_vec(),
                    content_type,
                });
            }
            _ => attachments.push(Attachment {
                filename: part.attachment_name().unwrap_or_default().to_string(),
                content: part.contents().to_vec(),
                content_type,
            }),
        }
    }

    let mut email = Email {
        uid: String::new(),
        sent_at,
        from,
        to,
        cc,
        bcc,
        subject,
        body,
        attachments,
        inline_images,
        resource_id: Some(resource_id.to_string()),
        sent: false,
    };
    email.ensure_uid();
    Ok(email)
}

/// Give every attachment a safe filename and a content type.
///
/// Missing names become `attachment_{n}`; directory components are stripped;
/// a missing content type is guessed from the extension.
pub fn format_attachments(mut email: Email) -> Email {
    for (idx, attachment) in email.attachments.iter_mut().enumerate() {
        let name = sanitize_filename(&attachment.filename);
        attachment.filename = if name.is_empty() {
            format!("attachment_{idx}")
        } else {
            name
        };

        if attachment.content_type.trim().is_empty() {
            attachment.content_type = guess_content_type(&attachment.filename).to_string();
        }
    }
    email
}

/// Embed inline images into the body so the stored email is self-contained.
///
/// Every `cid:<content-id>` reference in the body is replaced by a `data:`
/// URI. Images the body never references are kept as regular attachments,
/// named by their declared filename or else their Content-ID. Run
/// [`format_attachments`] afterwards so those get the same name fallbacks.
pub fn format_inline_images(mut email: Email) -> Email {
    for image in std::mem::take(&mut email.inline_images) {
        let reference = format!("cid:{}", image.content_id);
        let content_type = if image.content_type.is_empty() {
            guess_content_type(&image.content_id).to_string()
        } else {
            image.content_type
        };

        if email.body.contains(&reference) {
            let data_uri = format!(
                "data:{content_type};base64,{}",
                STANDARD.encode(&image.content)
            );
            email.body = email.body.replace(&reference, &data_uri);
        } else {
            let filename = match sanitize_filename(&image.filename) {
                name if name.is_empty() => sanitize_filename(&image.content_id),
                name => name,
            };
            email.attachments.push(Attachment {
                filename,
                content: image.content,
                content_type,
            });
        }
    }
    email
}

/// Flatten an address header (plain list or RFC 5322 groups) into bare addresses.
fn address_list(addr: &Address<'_>) -> Vec<String> {
    let addrs: Vec<&mail_parser::Addr<'_>> = match addr {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    };
    addrs
        .into_iter()
        .filter_map(|a| a.address())
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect()
}

/// Skip an mbox-style `From ` separator line (and a UTF-8 BOM) if present.
fn skip_from_line(data: &[u8]) -> &[u8] {
    let data = if data.starts_with(&[0xEF, 0xBB, 0xBF]) {
        &data[3..]
    } else {
        data
    };

    if data.starts_with(b"From ") {
        if let Some(pos) = data.iter().position(|&b| b == b'\n') {
            return &data[pos + 1..];
        }
    }
    data
}

fn strip_angle_brackets(id: &str) -> String {
    id.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

/// Keep only the last path component and drop control characters.
fn sanitize_filename(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned == "." || cleaned == ".." {
        String::new()
    } else {
        cleaned.to_string()
    }
}

/// Content type for common extensions.
fn guess_content_type(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" => "text/plain",
        "htm" | "html" => "text/html",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => DEFAULT_CONTENT_TYPE,
    }
}
