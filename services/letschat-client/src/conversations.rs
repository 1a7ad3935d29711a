use letschat_sync::Broadcaster;
use uuid::Uuid;

use crate::db::{Conversation, Db, DbError};

/// Latest-value view of the current user's conversation list, recomputed
/// from the local store whenever a message is saved.
pub struct Conversations {
    broadcaster: Broadcaster<Vec<Conversation>>,
}

impl Conversations {
    pub fn new() -> Self {
        Self {
            broadcaster: Broadcaster::new(Vec::new()),
        }
    }

    /// Recomputes the conversation list from the store and publishes it.
    pub fn refresh(&self, db: &Db, current_user: Uuid) -> Result<(), DbError> {
        let conversations = db.get_conversations(current_user)?;
        self.broadcaster.write(conversations);
        Ok(())
    }

    pub fn broadcaster(&self) -> &Broadcaster<Vec<Conversation>> {
        &self.broadcaster
    }
}

impl Default for Conversations {
    fn default() -> Self {
        Self::new()
    }
}
