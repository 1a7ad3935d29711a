use letschat_protocol::{Message, Operation};
use letschat_sync::Broadcaster;

/// The single receive-channel the UI subscribes to for both inbound frames
/// dispatched by `RecvDispatcher` and locally-completed sends published by
/// `SendPipeline`.
///
/// A message broadcast with `Operation::Local` set must never be
/// reprocessed by `RecvDispatcher` — that marker only identifies "this
/// component already applied this send," it is not itself routed back
/// through the dispatcher's operation switch.
pub struct RecvMsgs {
    broadcaster: Broadcaster<Option<Message>>,
}

impl RecvMsgs {
    pub fn new() -> Self {
        Self {
            broadcaster: Broadcaster::new(None),
        }
    }

    pub fn publish_inbound(&self, msg: Message) {
        self.broadcaster.write(Some(msg));
    }

    /// Publishes a just-completed local send, tagged so the dispatcher
    /// ignores any echo of it arriving back on this channel.
    pub fn publish_local_send(&self, mut msg: Message) {
        msg.operation = Operation::Local;
        self.broadcaster.write(Some(msg));
    }

    pub fn broadcaster(&self) -> &Broadcaster<Option<Message>> {
        &self.broadcaster
    }
}

impl Default for RecvMsgs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample() -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            body: Some("hi".to_owned()),
            sent_at: Some(Utc::now()),
            delivered_at: None,
            read_at: None,
            operation: Operation::Create,
        }
    }

    #[test]
    fn publish_local_send_tags_operation_local() {
        let recv_msgs = RecvMsgs::new();
        recv_msgs.publish_local_send(sample());
        let published = recv_msgs.broadcaster().get().unwrap();
        assert_eq!(published.operation, Operation::Local);
    }

    #[test]
    fn publish_inbound_preserves_operation() {
        let recv_msgs = RecvMsgs::new();
        recv_msgs.publish_inbound(sample());
        let published = recv_msgs.broadcaster().get().unwrap();
        assert_eq!(published.operation, Operation::Create);
    }
}
