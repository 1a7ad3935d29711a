use letschat_protocol::Message;
use tokio::sync::{mpsc, oneshot};

/// Outbound frames a mailbox can hold before its writer is considered too
/// slow to keep up.
pub const MAILBOX_CAPACITY: usize = 16;

/// A per-user outbound queue owned by the `Hub` while a `WireLoop` is
/// attached for that user. `enqueue` never blocks: a full mailbox is a
/// slow consumer and gets evicted rather than back-pressuring the sender.
pub struct Mailbox {
    tx: mpsc::Sender<Message>,
    close_slow: Option<oneshot::Sender<()>>,
}

/// The receiving half handed to the `WireLoop` writer task, paired with the
/// signal it must watch for a forced close.
pub struct MailboxHandle {
    pub rx: mpsc::Receiver<Message>,
    pub close_slow: oneshot::Receiver<()>,
}

impl Mailbox {
    pub fn new() -> (Self, MailboxHandle) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();
        (
            Mailbox {
                tx,
                close_slow: Some(close_tx),
            },
            MailboxHandle {
                rx,
                close_slow: close_rx,
            },
        )
    }

    /// Attempts to enqueue without waiting. Returns `false` and fires
    /// `CloseSlow` if the mailbox is full or its writer is already gone.
    pub fn enqueue(&mut self, msg: Message) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if let Some(close) = self.close_slow.take() {
                    let _ = close.send(());
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}
