use std::sync::Arc;
use std::time::Duration;

use letschat_protocol::{Confirmation, Message, Operation};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::conversations::Conversations;
use crate::db::{Db, DbError, MessageRow};
use crate::recv_msgs::RecvMsgs;

/// How long a single send waits for its ack before giving up and treating
/// the attempt as undelivered.
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Serializes every outbound send through the wire so only one message is
/// ever in flight at a time; the reconciler replays anything left pending
/// on reconnect.
pub struct SendPipeline {
    outbound: mpsc::Sender<Message>,
    acks: Arc<Mutex<mpsc::Receiver<bool>>>,
    db: Arc<Db>,
    conversations: Arc<Conversations>,
    recv_msgs: Arc<RecvMsgs>,
}

impl SendPipeline {
    pub fn new(
        outbound: mpsc::Sender<Message>,
        acks: mpsc::Receiver<bool>,
        db: Arc<Db>,
        conversations: Arc<Conversations>,
        recv_msgs: Arc<RecvMsgs>,
    ) -> Self {
        Self {
            outbound,
            acks: Arc::new(Mutex::new(acks)),
            db,
            conversations,
            recv_msgs,
        }
    }

    /// Drafts a message locally, attempts delivery, and reconciles the
    /// local copy against the outcome:
    ///
    /// - ack within the deadline -> `DeliveredConfirmed`, tagged
    ///   `Operation::Local` and pushed to `RecvMsgs` so the UI sees it as
    ///   sent without the dispatcher reprocessing it.
    /// - no ack in time, or send failure -> persisted with `sent_at`
    ///   cleared so the reconciler replays it once reconnected.
    pub async fn send(&self, draft: MessageRow) -> Result<(), DbError> {
        self.db.save_msg(&draft)?;
        self.conversations.refresh(&self.db, draft.sender_id)?;

        let wire_msg = Message {
            id: draft.id,
            sender_id: draft.sender_id,
            receiver_id: draft.receiver_id,
            body: draft.body.clone(),
            sent_at: draft.sent_at,
            delivered_at: None,
            read_at: None,
            operation: Operation::Create,
        };

        let send_failed = self.outbound.send(wire_msg).await.is_err();
        let acked = if send_failed {
            false
        } else {
            let mut acks = self.acks.lock().await;
            matches!(
                tokio::time::timeout(SEND_TIMEOUT, acks.recv()).await,
                Ok(Some(true))
            )
        };

        if acked {
            let mut delivered = draft;
            delivered.delivered_at = delivered.sent_at;
            delivered.confirmation = Confirmation::DeliveredConfirmed;
            self.db.save_msg(&delivered)?;
            self.conversations.refresh(&self.db, delivered.sender_id)?;
            self.recv_msgs.publish_local_send(Message {
                id: delivered.id,
                sender_id: delivered.sender_id,
                receiver_id: delivered.receiver_id,
                body: delivered.body,
                sent_at: delivered.sent_at,
                delivered_at: delivered.delivered_at,
                read_at: delivered.read_at,
                operation: Operation::Create,
            });
        } else {
            warn!(id = %draft.id, "send not acked within deadline, leaving for reconciler");
            let mut pending = draft;
            pending.sent_at = None;
            pending.confirmation = Confirmation::None;
            self.db.save_msg(&pending)?;
            self.conversations.refresh(&self.db, pending.sender_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn draft(sender: Uuid, receiver: Uuid) -> MessageRow {
        let now = Utc::now();
        MessageRow {
            id: Uuid::new_v4(),
            sender_id: sender,
            receiver_id: receiver,
            body: Some("hi".to_owned()),
            drafted_at: now,
            sent_at: Some(now),
            delivered_at: None,
            read_at: None,
            operation: Operation::Create,
            confirmation: Confirmation::None,
            version: 1,
        }
    }

    #[tokio::test]
    async fn acked_send_marks_delivered_and_publishes_local() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let conversations = Arc::new(Conversations::new());
        let recv_msgs = Arc::new(RecvMsgs::new());
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (ack_tx, ack_rx) = mpsc::channel(4);

        let pipeline = SendPipeline::new(out_tx, ack_rx, db.clone(), conversations, recv_msgs.clone());
        let sender = Uuid::new_v4();
        let receiver = Uuid::new_v4();
        let msg = draft(sender, receiver);
        let id = msg.id;

        let responder = tokio::spawn(async move {
            let _ = out_rx.recv().await;
            ack_tx.send(true).await.unwrap();
        });

        pipeline.send(msg).await.unwrap();
        responder.await.unwrap();

        let stored = db.get_msg_by_id(id).unwrap().unwrap();
        assert_eq!(stored.confirmation, Confirmation::DeliveredConfirmed);
        assert!(stored.delivered_at.is_some());
        let published = recv_msgs.broadcaster().get().unwrap();
        assert_eq!(published.operation, Operation::Local);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_send_clears_sent_at_for_the_reconciler() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let conversations = Arc::new(Conversations::new());
        let recv_msgs = Arc::new(RecvMsgs::new());
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (_ack_tx, ack_rx) = mpsc::channel(4);

        let pipeline = SendPipeline::new(out_tx, ack_rx, db.clone(), conversations, recv_msgs);
        let sender = Uuid::new_v4();
        let receiver = Uuid::new_v4();
        let msg = draft(sender, receiver);
        let id = msg.id;

        let drainer = tokio::spawn(async move {
            let _ = out_rx.recv().await;
        });

        pipeline.send(msg).await.unwrap();
        drainer.await.unwrap();

        let stored = db.get_msg_by_id(id).unwrap().unwrap();
        assert_eq!(stored.confirmation, Confirmation::None);
        assert!(stored.sent_at.is_none());
    }
}
