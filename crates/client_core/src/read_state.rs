use shared::domain::UserId;
use storage::ConversationStore;
use tracing::{debug, warn};

/// Flags every unread message `peer` sent to `owner` as read.
///
/// Failures are logged and absorbed; the conversation stays usable and the
/// unread count is simply left stale. Returns the number of rows changed.
pub async fn mark_conversation_read(
    store: &dyn ConversationStore,
    owner: UserId,
    peer: UserId,
) -> u64 {
    match store.mark_read(owner, peer).await {
        Ok(updated) => {
            debug!(%owner, %peer, updated, "read-state: inbound messages marked read");
            updated
        }
        Err(err) => {
            warn!(
                %owner,
                %peer,
                error = %format!("{err:#}"),
                "read-state: mark read failed; unread count left stale"
            );
            0
        }
    }
}
