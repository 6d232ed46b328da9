use e2ee::{seal, ConversationKey};
use shared::{
    domain::UserId,
    error::ChatError,
    protocol::{MessageRecord, NewMessage},
};
use storage::ConversationStore;
use tracing::{debug, info, warn};

/// Seals `plaintext` for the `(sender, recipient)` conversation and persists it.
///
/// Whitespace-only input is dropped without touching the store and yields
/// `Ok(None)`. Surrounding whitespace is trimmed before sealing. On a store
/// failure nothing is written and the caller keeps its draft.
pub async fn send_sealed(
    store: &dyn ConversationStore,
    sender: UserId,
    recipient: UserId,
    plaintext: &str,
    key: &ConversationKey,
    attachment_url: Option<String>,
) -> Result<Option<MessageRecord>, ChatError> {
    let body = plaintext.trim();
    if body.is_empty() {
        debug!(%sender, %recipient, "send: blank message dropped");
        return Ok(None);
    }

    let envelope = seal(key, body.as_bytes())?;
    let record = store
        .insert(NewMessage {
            sender_id: sender,
            recipient_id: recipient,
            content: envelope.into_string(),
            encrypted: true,
            attachment_url,
        })
        .await
        .map_err(|err| {
            warn!(%sender, %recipient, error = %format!("{err:#}"), "send: store rejected message");
            ChatError::persistence(format!("{err:#}"))
        })?;

    info!(message_id = record.id.0, %sender, %recipient, "send: message persisted");
    Ok(Some(record))
}
