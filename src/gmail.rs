use crate::models::MailMessage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use google_gmail1::Gmail;
use google_gmail1::api::{BatchModifyMessagesRequest, Message, MessagePart};
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;

#[derive(Debug, thiserror::Error)]
pub enum MailApiError {
    /// The provider no longer accepts the history cursor (expired or unknown).
    #[error("history cursor rejected by provider")]
    CursorInvalid,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Messages added since a history cursor, plus the cursor to resume from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    pub message_ids: Vec<String>,
    pub history_id: Option<u64>,
}

#[async_trait]
pub trait MailApi: Send + Sync {
    /// The mailbox's current history id, used as a sync baseline.
    async fn current_history_id(&self) -> Result<u64>;

    async fn list_history(&self, start_history_id: u64) -> Result<HistoryPage, MailApiError>;

    async fn list_message_ids(&self, query: &str, max_results: u32) -> Result<Vec<String>>;

    async fn get_message(&self, id: &str) -> Result<MailMessage>;

    async fn send_reply(&self, original: &MailMessage, subject: &str, body: &str) -> Result<()>;

    async fn modify_labels(&self, id: &str, add: &[&str], remove: &[&str]) -> Result<()>;

    async fn trash_message(&self, id: &str) -> Result<()>;

    async fn archive_message(&self, id: &str) -> Result<()> {
        self.modify_labels(id, &[], &["INBOX"]).await
    }

    async fn mark_as_read(&self, id: &str) -> Result<()> {
        self.modify_labels(id, &[], &["UNREAD"]).await
    }

    async fn mark_as_unread(&self, id: &str) -> Result<()> {
        self.modify_labels(id, &["UNREAD"], &[]).await
    }
}

#[derive(Clone)]
pub struct GmailClient {
    hub: Gmail<HttpsConnector<HttpConnector>>,
}

impl GmailClient {
    pub fn new(hub: Gmail<HttpsConnector<HttpConnector>>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl MailApi for GmailClient {
    async fn current_history_id(&self) -> Result<u64> {
        let (_, profile) = self
            .hub
            .users()
            .get_profile("me")
            .doit()
            .await
            .context("Failed to load mailbox profile")?;

        profile
            .history_id
            .context("Mailbox profile has no history id")
    }

    async fn list_history(&self, start_history_id: u64) -> Result<HistoryPage, MailApiError> {
        let mut page = HistoryPage::default();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self
                .hub
                .users()
                .history_list("me")
                .start_history_id(start_history_id)
                .add_history_types("messageAdded");

            if let Some(token) = &page_token {
                req = req.page_token(token);
            }

            let (_, response) = match req.doit().await {
                Ok(ok) => ok,
                Err(e) if is_not_found(&e) => return Err(MailApiError::CursorInvalid),
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context("Failed to list mailbox history")
                        .into());
                }
            };

            for record in response.history.unwrap_or_default() {
                for added in record.messages_added.unwrap_or_default() {
                    if let Some(id) = added.message.and_then(|m| m.id) {
                        if !page.message_ids.contains(&id) {
                            page.message_ids.push(id);
                        }
                    }
                }
            }

            if response.history_id.is_some() {
                page.history_id = response.history_id;
            }

            match response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(page)
    }

    async fn list_message_ids(&self, query: &str, max_results: u32) -> Result<Vec<String>> {
        let (_, message_list) = self
            .hub
            .users()
            .messages_list("me")
            .q(query)
            .max_results(max_results)
            .doit()
            .await
            .context("Failed to list messages")?;

        Ok(message_list
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.id)
            .collect())
    }

    async fn get_message(&self, id: &str) -> Result<MailMessage> {
        let (_, msg) = self
            .hub
            .users()
            .messages_get("me", id)
            .format("full")
            .doit()
            .await
            .context(format!("Failed to get message {}", id))?;

        let mut from = None;
        let mut to = None;
        let mut subject = None;
        let mut message_id_header = None;

        if let Some(payload) = &msg.payload {
            if let Some(headers) = &payload.headers {
                for header in headers {
                    match header.name.as_deref().map(str::to_ascii_lowercase).as_deref() {
                        Some("from") => from = header.value.clone(),
                        Some("to") => to = header.value.clone(),
                        Some("subject") => subject = header.value.clone(),
                        Some("message-id") => message_id_header = header.value.clone(),
                        _ => {}
                    }
                }
            }
        }

        Ok(MailMessage {
            id: msg.id.unwrap_or_default(),
            thread_id: msg.thread_id.unwrap_or_default(),
            from_address: from,
            to_address: to,
            subject,
            snippet: msg.snippet,
            message_id_header,
            label_ids: msg.label_ids.unwrap_or_default(),
            has_attachments: msg.payload.as_ref().is_some_and(has_attachment),
            internal_date: msg.internal_date.unwrap_or(0),
        })
    }

    async fn send_reply(&self, original: &MailMessage, subject: &str, body: &str) -> Result<()> {
        let to = original
            .from_address
            .as_deref()
            .context("Original message has no sender to reply to")?;
        let raw_message = build_reply(original, to, subject, body);
        let mime_type: mime::Mime = "message/rfc822".parse()?;

        use std::io::Cursor;
        let cursor = Cursor::new(raw_message.into_bytes());

        let envelope = Message {
            thread_id: Some(original.thread_id.clone()),
            ..Default::default()
        };

        self.hub
            .users()
            .messages_send(envelope, "me")
            .upload(cursor, mime_type)
            .await
            .context("Failed to send reply")?;

        Ok(())
    }

    async fn modify_labels(&self, id: &str, add: &[&str], remove: &[&str]) -> Result<()> {
        let to_vec = |labels: &[&str]| {
            (!labels.is_empty()).then(|| labels.iter().map(|l| l.to_string()).collect::<Vec<_>>())
        };
        let req = BatchModifyMessagesRequest {
            ids: Some(vec![id.to_string()]),
            add_label_ids: to_vec(add),
            remove_label_ids: to_vec(remove),
        };
        self.hub
            .users()
            .messages_batch_modify(req, "me")
            .doit()
            .await
            .context("Failed to modify message labels")?;
        Ok(())
    }

    async fn trash_message(&self, id: &str) -> Result<()> {
        self.hub
            .users()
            .messages_trash("me", id)
            .doit()
            .await
            .context("Failed to trash message")?;
        Ok(())
    }
}

fn is_not_found(err: &google_gmail1::Error) -> bool {
    match err {
        google_gmail1::Error::BadRequest(value) => {
            value.pointer("/error/code").and_then(|c| c.as_u64()) == Some(404)
        }
        google_gmail1::Error::Failure(response) => {
            response.status() == hyper::StatusCode::NOT_FOUND
        }
        _ => false,
    }
}

fn has_attachment(part: &MessagePart) -> bool {
    if part.filename.as_deref().is_some_and(|f| !f.is_empty()) {
        return true;
    }
    part.parts
        .as_ref()
        .is_some_and(|parts| parts.iter().any(has_attachment))
}

fn build_reply(original: &MailMessage, to: &str, subject: &str, body: &str) -> String {
    let mut raw = format!("From: me\r\nTo: {}\r\nSubject: {}\r\n", to, subject);
    if let Some(message_id) = &original.message_id_header {
        raw.push_str(&format!(
            "In-Reply-To: {}\r\nReferences: {}\r\n",
            message_id, message_id
        ));
    }
    raw.push_str("Content-Type: text/plain; charset=\"UTF-8\"\r\n\r\n");
    raw.push_str(body);
    raw
}

/// `Re: <subject>` unless the subject is already a reply.
pub fn reply_subject(original: Option<&str>) -> String {
    let subject = original.unwrap_or("").trim();
    if subject.to_ascii_lowercase().starts_with("re:") {
        subject.to_string()
    } else {
        format!("Re: {}", subject)
    }
}
