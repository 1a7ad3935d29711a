use std::sync::Arc;

use chrono::Utc;
use letschat_protocol::{Confirmation, Message, Operation};
use tokio::sync::mpsc;
use tracing::error;
use uuid::Uuid;

use crate::conversations::Conversations;
use crate::db::{Db, DbError};
use crate::recv_msgs::RecvMsgs;

/// Updates with a stale `version` are retried this many times before the
/// dispatcher gives up and drops the update on the floor.
const UPDATE_RETRIES: u32 = 5;

/// Applies each inbound frame from the wire to local state, one operation
/// per switch arm, then republishes it on the shared `RecvMsgs` broadcaster
/// so the UI's single subscription sees both this traffic and
/// `SendPipeline`'s locally-completed sends. Frames tagged
/// `Operation::Local` are never seen here — `run` filters them before
/// dispatch, since that marker exists only to stop exactly this replay.
pub struct RecvDispatcher {
    db: Arc<Db>,
    conversations: Arc<Conversations>,
    recv_msgs: Arc<RecvMsgs>,
    // The wire loop's no-ack path. A synthetic delivery ack has nobody
    // waiting on its outcome, so it must never share a channel with
    // `SendPipeline`'s acked sends.
    fire_and_forget: mpsc::Sender<Message>,
    current_user: Uuid,
}

impl RecvDispatcher {
    pub fn new(
        db: Arc<Db>,
        conversations: Arc<Conversations>,
        recv_msgs: Arc<RecvMsgs>,
        fire_and_forget: mpsc::Sender<Message>,
        current_user: Uuid,
    ) -> Self {
        Self {
            db,
            conversations,
            recv_msgs,
            fire_and_forget,
            current_user,
        }
    }

    /// Drains `inbound` until the channel closes, applying each frame in
    /// turn, republishing it for the UI, and refreshing conversations
    /// afterward.
    pub async fn run(&self, mut inbound: mpsc::Receiver<Message>) {
        while let Some(msg) = inbound.recv().await {
            if msg.operation == Operation::Local {
                continue;
            }
            let published = msg.clone();
            if let Err(e) = self.dispatch(msg).await {
                error!(error = %e, "failed to apply inbound message");
            }
            self.recv_msgs.publish_inbound(published);
            if let Err(e) = self.conversations.refresh(&self.db, self.current_user) {
                error!(error = %e, "failed to refresh conversations");
            }
        }
    }

    async fn dispatch(&self, msg: Message) -> Result<(), DbError> {
        match msg.operation {
            Operation::Create => self.handle_create(msg).await,
            Operation::Update => self.handle_update(&msg),
            Operation::Delete => {
                self.db.delete_msg(msg.id)?;
                Ok(())
            }
            Operation::UserOnline => {
                self.db.set_user_last_online(msg.sender_id, msg.sent_at)?;
                Ok(())
            }
            Operation::UserOffline => {
                self.db.set_user_last_online(msg.sender_id, None)?;
                Ok(())
            }
            Operation::UserTyping | Operation::Local => Ok(()),
        }
    }

    async fn handle_create(&self, msg: Message) -> Result<(), DbError> {
        let row = crate::db::MessageRow {
            id: msg.id,
            sender_id: msg.sender_id,
            receiver_id: msg.receiver_id,
            body: msg.body.clone(),
            drafted_at: msg.sent_at.unwrap_or_else(Utc::now),
            sent_at: msg.sent_at,
            delivered_at: None,
            read_at: None,
            operation: Operation::Create,
            confirmation: Confirmation::None,
            version: 1,
        };
        self.db.save_msg(&row)?;

        let ack = Message {
            id: msg.id,
            sender_id: self.current_user,
            receiver_id: msg.sender_id,
            body: None,
            sent_at: None,
            delivered_at: Some(Utc::now()),
            read_at: None,
            operation: Operation::Update,
        };
        let _ = self.fire_and_forget.send(ack).await;
        Ok(())
    }

    fn handle_update(&self, msg: &Message) -> Result<(), DbError> {
        let Some(mut existing) = self.db.get_msg_by_id(msg.id)? else {
            return Ok(());
        };
        if msg.delivered_at.is_some() {
            existing.delivered_at = msg.delivered_at;
        }
        if msg.read_at.is_some() {
            existing.read_at = msg.read_at;
        }
        existing.operation = Operation::Update;

        for _ in 0..UPDATE_RETRIES {
            match self.db.update_msg(&existing) {
                Ok(()) => return Ok(()),
                Err(DbError::EditConflict(_)) => {
                    let Some(refreshed) = self.db.get_msg_by_id(msg.id)? else {
                        return Ok(());
                    };
                    existing = refreshed;
                    if msg.delivered_at.is_some() {
                        existing.delivered_at = msg.delivered_at;
                    }
                    if msg.read_at.is_some() {
                        existing.read_at = msg.read_at;
                    }
                    existing.operation = Operation::Update;
                }
                Err(DbError::RecordNotFound) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
