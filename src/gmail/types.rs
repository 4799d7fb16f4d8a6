use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

// Message list (users.messages.list)

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageListResponse {
    #[serde(default)]
    pub messages: Option<Vec<MessageRef>>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub result_size_estimate: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub thread_id: Option<String>,
}

// Full message (users.messages.get, format=full)

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: Option<MessagePart>,
    #[serde(default)]
    #[allow(dead_code)]
    pub size_estimate: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    #[allow(dead_code)]
    pub part_id: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Option<Vec<Header>>,
    #[serde(default)]
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Option<Vec<MessagePart>>,
}

#[derive(Debug, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub data: Option<String>,
}

// Attachment blob (users.messages.attachments.get)

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentResponse {
    #[serde(default)]
    #[allow(dead_code)]
    pub size: Option<u64>,
    pub data: String,
}

// --- Flattened view consumed by the filter engine ---

/// One attachment in a message's manifest. The bytes stay on the server
/// until the orchestrator decides to pull them by `attachment_id`.
#[derive(Debug, Clone)]
pub struct AttachmentRef {
    pub filename: String,
    pub attachment_id: String,
    pub size: u64,
}

/// One retrieved message under evaluation. Built once from the API payload,
/// consumed once, never mutated.
#[derive(Debug, Clone)]
pub struct CandidateMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body_text: String,
    pub internal_date: DateTime<Utc>,
    pub attachments: Vec<AttachmentRef>,
}

/// Gmail body data is base64url; padding is inconsistent across parts, so
/// strip it and decode without.
pub fn decode_body_data(data: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()
}

fn header_value<'a>(part: &'a MessagePart, name: &str) -> Option<&'a str> {
    part.headers
        .as_ref()?
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn collect_text(part: &MessagePart, mime: &str, out: &mut Vec<String>) {
    if part.mime_type.as_deref() == Some(mime) {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
            if let Some(bytes) = decode_body_data(data) {
                out.push(String::from_utf8_lossy(&bytes).into_owned());
            }
        }
    }
    if let Some(parts) = &part.parts {
        for child in parts {
            collect_text(child, mime, out);
        }
    }
}

fn collect_attachments(part: &MessagePart, out: &mut Vec<AttachmentRef>) {
    let filename = part.filename.as_deref().unwrap_or("");
    if !filename.is_empty() {
        if let Some(body) = &part.body {
            if let Some(attachment_id) = &body.attachment_id {
                out.push(AttachmentRef {
                    filename: filename.to_string(),
                    attachment_id: attachment_id.clone(),
                    size: body.size.unwrap_or(0),
                });
            }
        }
    }
    if let Some(parts) = &part.parts {
        for child in parts {
            collect_attachments(child, out);
        }
    }
}

impl CandidateMessage {
    /// Flatten a full-format API message: headers, a body text (text/plain
    /// parts concatenated, falling back to the raw text of text/html parts),
    /// and the attachment manifest.
    pub fn from_message(message: &GmailMessage) -> CandidateMessage {
        let internal_date = message
            .internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        let (from, to, subject, body_text, attachments) = match &message.payload {
            Some(payload) => {
                let mut texts = Vec::new();
                collect_text(payload, "text/plain", &mut texts);
                if texts.is_empty() {
                    collect_text(payload, "text/html", &mut texts);
                }
                let mut attachments = Vec::new();
                collect_attachments(payload, &mut attachments);
                (
                    header_value(payload, "From").unwrap_or("").to_string(),
                    header_value(payload, "To").unwrap_or("").to_string(),
                    header_value(payload, "Subject").unwrap_or("").to_string(),
                    texts.join("\n"),
                    attachments,
                )
            }
            None => Default::default(),
        };

        CandidateMessage {
            id: message.id.clone(),
            from,
            to,
            subject,
            body_text,
            internal_date,
            attachments,
        }
    }
}
