use super::types::*;

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

#[derive(Debug)]
pub enum GmailError {
    Http(String),
    Parse(String),
    Api(String),
    Auth(String),
}

impl std::fmt::Display for GmailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GmailError::Http(e) => write!(f, "HTTP error: {}", e),
            GmailError::Parse(e) => write!(f, "Parse error: {}", e),
            GmailError::Api(e) => write!(f, "API error: {}", e),
            GmailError::Auth(e) => write!(f, "Authentication error: {}", e),
        }
    }
}

pub struct GmailClient {
    access_token: String,
    base_url: String,
}

impl GmailClient {
    pub fn new(access_token: &str) -> Self {
        Self::with_base_url(access_token, GMAIL_API_BASE)
    }

    /// Point the client at an alternate endpoint. Integration tests use this
    /// to talk to a local mock server.
    pub fn with_base_url(access_token: &str, base_url: &str) -> Self {
        GmailClient {
            access_token: access_token.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<String, GmailError> {
        let url = format!("{}{}", self.base_url, path);
        log_debug!("[GMAIL] GET {} {:?}", url, query);

        let mut request = ureq::get(&url)
            .set("Authorization", &format!("Bearer {}", self.access_token));
        for (key, value) in query {
            request = request.query(key, value);
        }

        match request.call() {
            Ok(response) => {
                let body = response
                    .into_string()
                    .map_err(|e| GmailError::Parse(format!("Failed to read response: {}", e)))?;
                log_debug!("[GMAIL] Response body length: {} bytes", body.len());
                Ok(body)
            }
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                log_error!("[GMAIL] HTTP error {}: {}", code, truncate_str(&body, 200));
                if code == 401 {
                    return Err(GmailError::Auth(
                        "Access token rejected (401 Unauthorized)".to_string(),
                    ));
                }
                if code == 403 {
                    return Err(GmailError::Auth(format!(
                        "Access denied (403): {}",
                        truncate_str(&body, 200)
                    )));
                }
                if let Some(message) = api_error_message(&body) {
                    return Err(GmailError::Api(format!("HTTP {}: {}", code, message)));
                }
                Err(GmailError::Http(format!(
                    "HTTP {} error: {}",
                    code,
                    if body.is_empty() {
                        "(empty response)".to_string()
                    } else {
                        truncate_str(&body, 200).to_string()
                    }
                )))
            }
            Err(e) => {
                log_error!("[GMAIL] Connection error: {}", e);
                Err(GmailError::Http(e.to_string()))
            }
        }
    }

    /// List all message ids matching a search query, following pagination.
    pub fn list_messages(&self, query: &str) -> Result<Vec<String>, GmailError> {
        log_info!("[GMAIL] Listing messages for query: {}", query);

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params: Vec<(&str, &str)> =
                vec![("q", query), ("maxResults", "100")];
            if let Some(token) = &page_token {
                params.push(("pageToken", token));
            }

            let body = self.get("/messages", &params)?;
            let page: MessageListResponse = serde_json::from_str(&body)
                .map_err(|e| GmailError::Parse(format!("Failed to parse list: {}", e)))?;

            if let Some(messages) = page.messages {
                ids.extend(messages.into_iter().map(|m| m.id));
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        log_info!("[GMAIL] Query matched {} messages", ids.len());
        Ok(ids)
    }

    /// Fetch a full message and flatten it for the filter engine.
    pub fn get_message(&self, id: &str) -> Result<CandidateMessage, GmailError> {
        log_debug!("[GMAIL] Fetching message: {}", id);

        let body = self.get(&format!("/messages/{}", id), &[("format", "full")])?;
        let message: GmailMessage = serde_json::from_str(&body)
            .map_err(|e| GmailError::Parse(format!("Failed to parse message {}: {}", id, e)))?;

        Ok(CandidateMessage::from_message(&message))
    }

    /// Download one attachment body and decode it.
    pub fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, GmailError> {
        log_debug!(
            "[GMAIL] Fetching attachment {} of message {}",
            attachment_id,
            message_id
        );

        let body = self.get(
            &format!("/messages/{}/attachments/{}", message_id, attachment_id),
            &[],
        )?;
        let attachment: AttachmentResponse = serde_json::from_str(&body)
            .map_err(|e| GmailError::Parse(format!("Failed to parse attachment: {}", e)))?;

        let bytes = decode_body_data(&attachment.data).ok_or_else(|| {
            GmailError::Parse("Attachment data is not valid base64url".to_string())
        })?;

        log_info!("[GMAIL] Attachment downloaded, {} bytes", bytes.len());
        Ok(bytes)
    }
}

/// Extract the message from a Gmail error body: `{"error": {"message": ...}}`.
fn api_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(|s| s.to_string())
}

fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        s
    } else {
        let mut end = max_len;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
