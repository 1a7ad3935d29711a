use std::sync::Arc;

use chrono::Utc;
use letschat_protocol::Message;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::conversations::Conversations;
use crate::db::{Db, DbError};
use crate::send_pipeline::SendPipeline;

/// Runs once per reconnect transition (offline -> online).
///
/// Fetching undelivered-to-me messages is not a separate pull here: the
/// server's `Hub::attach` replays its unrouted backlog for this user
/// directly into the freshly attached mailbox, so those messages simply
/// arrive over the same `WireLoop` -> `RecvDispatcher` path as any other
/// inbound frame (documented choice, see DESIGN.md). `Reconciler`
/// therefore owns the two steps that remain: replaying pending outbound
/// sends, and marking messages the UI reports as seen while offline as
/// read.
pub struct Reconciler {
    db: Arc<Db>,
    conversations: Arc<Conversations>,
    send_pipeline: Arc<SendPipeline>,
    current_user: Uuid,
}

impl Reconciler {
    pub fn new(
        db: Arc<Db>,
        conversations: Arc<Conversations>,
        send_pipeline: Arc<SendPipeline>,
        current_user: Uuid,
    ) -> Self {
        Self {
            db,
            conversations,
            send_pipeline,
            current_user,
        }
    }

    /// Replay drafted-but-unsent messages, oldest draft first
    /// (`Db::get_pending_outbound` already orders this way). The replayed
    /// `sent_at` is set to the original draft time rather than "now", so
    /// the ordering guarantee ("replayed outbound is ordered by original
    /// sentAt ascending") stays meaningful to the receiving peer.
    ///
    /// If a send fails mid-reconcile, the cycle stops rather than looping
    /// tightly — the next reconnect will pick up whatever is still
    /// pending.
    pub async fn reconcile_outbound(&self) -> Result<(), DbError> {
        let pending = self.db.get_pending_outbound()?;
        info!(count = pending.len(), "replaying pending outbound");
        for mut row in pending {
            row.sent_at = Some(row.drafted_at);
            if let Err(e) = self.send_pipeline.send(row).await {
                warn!(error = %e, "reconcile aborted, will retry on next reconnect");
                return Ok(());
            }
        }
        self.conversations.refresh(&self.db, self.current_user)?;
        Ok(())
    }

    /// Mark messages the UI reports as currently visible as read.
    /// "Currently on the screen" is UI-owned state this crate does not
    /// track — the terminal UI rendering layer is an external
    /// collaborator — so the caller supplies the ids.
    ///
    /// `fire_and_forget` must be the wire loop's no-ack outbound path
    /// (see `wire::run_wire_loop`), never the channel `SendPipeline` reads
    /// acks against — nobody awaits the outcome of a read receipt.
    pub async fn mark_as_read(
        &self,
        message_ids: &[Uuid],
        fire_and_forget: &mpsc::Sender<Message>,
    ) -> Result<(), DbError> {
        for &id in message_ids {
            let Some(mut row) = self.db.get_msg_by_id(id)? else {
                continue;
            };
            if row.read_at.is_some() {
                continue;
            }
            let now = Utc::now();
            row.read_at = Some(now);
            row.operation = letschat_protocol::Operation::Update;
            self.db.update_msg(&row)?;

            let update = Message {
                id: row.id,
                sender_id: self.current_user,
                receiver_id: row.sender_id,
                body: None,
                sent_at: None,
                delivered_at: None,
                read_at: Some(now),
                operation: letschat_protocol::Operation::Update,
            };
            let _ = fire_and_forget.send(update).await;
        }
        self.conversations.refresh(&self.db, self.current_user)?;
        Ok(())
    }

    /// Runs the full reconnect cycle: step 2 then step 3 over whatever the
    /// caller currently considers "on screen" (possibly empty).
    pub async fn run(
        &self,
        visible_message_ids: &[Uuid],
        fire_and_forget: &mpsc::Sender<Message>,
    ) -> Result<(), DbError> {
        self.reconcile_outbound().await?;
        self.mark_as_read(visible_message_ids, fire_and_forget).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MessageRow;
    use crate::recv_msgs::RecvMsgs;
    use letschat_protocol::{Confirmation, Operation};

    fn draft_row(sender: Uuid, receiver: Uuid) -> MessageRow {
        let now = Utc::now();
        MessageRow {
            id: Uuid::new_v4(),
            sender_id: sender,
            receiver_id: receiver,
            body: Some("hi".to_owned()),
            drafted_at: now,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            operation: Operation::Create,
            confirmation: Confirmation::None,
            version: 1,
        }
    }

    #[tokio::test]
    async fn reconcile_outbound_replays_pending_sends_with_original_draft_time() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let conversations = Arc::new(Conversations::new());
        let recv_msgs = Arc::new(RecvMsgs::new());
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (ack_tx, ack_rx) = mpsc::channel(8);

        let sender = Uuid::new_v4();
        let receiver = Uuid::new_v4();
        let pending = draft_row(sender, receiver);
        let drafted_at = pending.drafted_at;
        db.save_msg(&pending).unwrap();

        let pipeline = Arc::new(SendPipeline::new(out_tx, ack_rx, db.clone(), conversations.clone(), recv_msgs));
        let reconciler = Reconciler::new(db.clone(), conversations, pipeline, sender);

        let responder = tokio::spawn(async move {
            let sent = out_rx.recv().await.unwrap();
            assert_eq!(sent.sent_at, Some(drafted_at));
            ack_tx.send(true).await.unwrap();
        });

        reconciler.reconcile_outbound().await.unwrap();
        responder.await.unwrap();

        let stored = db.get_msg_by_id(pending.id).unwrap().unwrap();
        assert_eq!(stored.confirmation, Confirmation::DeliveredConfirmed);
        assert_eq!(stored.sent_at, Some(drafted_at));
    }

    #[tokio::test]
    async fn mark_as_read_sets_read_at_and_emits_an_update_frame() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let conversations = Arc::new(Conversations::new());
        let current_user = Uuid::new_v4();
        let peer = Uuid::new_v4();

        let mut row = draft_row(peer, current_user);
        row.sent_at = Some(Utc::now());
        row.delivered_at = Some(Utc::now());
        db.save_msg(&row).unwrap();

        let recv_msgs = Arc::new(RecvMsgs::new());
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (_ack_tx, ack_rx) = mpsc::channel(8);
        let pipeline = Arc::new(SendPipeline::new(out_tx.clone(), ack_rx, db.clone(), conversations.clone(), recv_msgs));
        let reconciler = Reconciler::new(db.clone(), conversations, pipeline, current_user);

        let (report_tx, mut report_rx) = mpsc::channel(8);
        reconciler.mark_as_read(&[row.id], &report_tx).await.unwrap();

        let stored = db.get_msg_by_id(row.id).unwrap().unwrap();
        assert!(stored.read_at.is_some());

        let update = report_rx.try_recv().unwrap();
        assert_eq!(update.operation, Operation::Update);
        assert!(update.read_at.is_some());
        drop(out_tx);
    }

    #[tokio::test]
    async fn mark_as_read_is_a_no_op_for_an_unknown_id() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let conversations = Arc::new(Conversations::new());
        let recv_msgs = Arc::new(RecvMsgs::new());
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (_ack_tx, ack_rx) = mpsc::channel(8);
        let pipeline = Arc::new(SendPipeline::new(out_tx, ack_rx, db.clone(), conversations.clone(), recv_msgs));
        let reconciler = Reconciler::new(db, conversations, pipeline, Uuid::new_v4());

        let (report_tx, _report_rx) = mpsc::channel(8);
        reconciler
            .mark_as_read(&[Uuid::new_v4()], &report_tx)
            .await
            .unwrap();
    }
}
