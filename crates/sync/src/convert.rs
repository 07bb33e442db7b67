use zova_client::wire::{WireContent, WireMessage, WirePart, WireRole};

use crate::attachments::content_from_text;
use crate::ids::MessageId;
use crate::message::{ContentPart, Message, MessageContent, MessageStatus, Role, now_unix_millis};

pub(crate) fn role_from_wire(role: WireRole) -> Role {
    match role {
        WireRole::System => Role::System,
        WireRole::User => Role::User,
        WireRole::Assistant => Role::Assistant,
    }
}

pub(crate) fn content_from_wire(content: WireContent) -> MessageContent {
    match content {
        WireContent::Text(text) => content_from_text(text),
        WireContent::Parts(parts) => {
            let parts = parts
                .into_iter()
                .filter_map(part_from_wire)
                .collect::<Vec<_>>();
            match parts.as_slice() {
                [ContentPart::Text(text)] => MessageContent::Text(text.clone()),
                _ => MessageContent::Parts(parts),
            }
        }
    }
}

fn part_from_wire(part: WirePart) -> Option<ContentPart> {
    match part {
        WirePart::Text { text } => Some(ContentPart::Text(text)),
        WirePart::Image {
            blob_id: Some(blob_id),
            ..
        } => Some(ContentPart::Image { blob_id }),
        WirePart::File {
            blob_id: Some(blob_id),
            name,
            ..
        } => Some(ContentPart::File { blob_id, name }),
        WirePart::Image { blob_id: None, .. } | WirePart::File { blob_id: None, .. } => {
            tracing::debug!("dropped history attachment without a blob id");
            None
        }
    }
}

/// History messages without a server id cannot be placed and are dropped.
pub(crate) fn message_from_wire(message: WireMessage) -> Option<Message> {
    let Some(id) = message.id else {
        tracing::warn!(role = ?message.role, "dropped history message without an id");
        return None;
    };

    Some(
        Message::new(
            MessageId::Server(id),
            role_from_wire(message.role),
            content_from_wire(message.content),
            MessageStatus::Done,
        )
        .with_created_at(message.created_at.unwrap_or_else(now_unix_millis)),
    )
}
