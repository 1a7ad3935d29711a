use futures_util::{Sink, SinkExt, Stream, StreamExt};
use letschat_protocol::{Heartbeat, Message, WsFrame};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("WS: {0}")]
    Ws(#[from] tungstenite::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("DB: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("UnexpectedFirstMessage")]
    UnexpectedFirstMessage,
    #[error("ConnectionClosed")]
    ConnectionClosed,
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Both cooperating halves of a duplex connection over one socket: reads
/// frames into `inbound`, writes frames taken from `outbound` (acking each
/// one) and from `fire_and_forget` (no ack), sends a heartbeat every 10s,
/// and tears down on the first write error or a read-timeout (the
/// client-side "pong deadline").
///
/// `outbound` and `acks` form a matched pair: exactly one boolean reaches
/// `acks` for every frame pulled from `outbound`, so `outbound` must only
/// ever have one producer, namely `SendPipeline`, which is the only caller
/// that awaits `acks`. Anything else that needs to put a frame on the wire
/// without a caller waiting on its outcome — `RecvDispatcher`'s synthetic
/// delivery acks, `Reconciler`'s read receipts — goes through
/// `fire_and_forget` instead, so it can never desync or starve the acks
/// channel.
///
/// Generic over `Stream + Sink` so it is testable against an in-memory
/// transport without a live socket.
pub async fn run_wire_loop<S>(
    mut ws: S,
    session_id: String,
    mut outbound: mpsc::Receiver<Message>,
    mut fire_and_forget: mpsc::Receiver<Message>,
    inbound: mpsc::Sender<Message>,
    acks: mpsc::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SessionError>
where
    S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
        + Sink<tungstenite::Message, Error = tungstenite::Error>
        + Unpin,
{
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(msg) => {
                        let frame = WsFrame::Message(msg);
                        let text = serde_json::to_string(&frame)?;
                        // The ack here means the local socket write
                        // succeeded within the deadline — not that the
                        // server has stored the message.
                        match ws.send(tungstenite::Message::Text(text.into())).await {
                            Ok(()) => {
                                let _ = acks.send(true).await;
                            }
                            Err(e) => {
                                let _ = acks.send(false).await;
                                return Err(e.into());
                            }
                        }
                    }
                    None => break,
                }
            }
            outgoing = fire_and_forget.recv() => {
                match outgoing {
                    Some(msg) => {
                        let frame = WsFrame::Message(msg);
                        let text = serde_json::to_string(&frame)?;
                        ws.send(tungstenite::Message::Text(text.into())).await?;
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                let frame = WsFrame::Heartbeat(Heartbeat { session_id: session_id.clone() });
                let text = serde_json::to_string(&frame)?;
                ws.send(tungstenite::Message::Text(text.into())).await?;
            }
            incoming = tokio::time::timeout(READ_TIMEOUT, ws.next()) => {
                match incoming {
                    Ok(Some(Ok(tungstenite::Message::Text(text)))) => {
                        match serde_json::from_str::<WsFrame>(&text) {
                            Ok(WsFrame::Message(msg)) => {
                                if inbound.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Ok(WsFrame::Heartbeat(_)) => {}
                            Ok(WsFrame::Error(err)) => {
                                warn!(code = %err.code, message = %err.message, "server error frame");
                                if !err.retryable {
                                    return Err(SessionError::ConnectionClosed);
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "malformed frame from server");
                            }
                        }
                    }
                    Ok(Some(Ok(tungstenite::Message::Close(_)))) | Ok(None) => {
                        debug!("server closed connection");
                        break;
                    }
                    Ok(Some(Ok(tungstenite::Message::Ping(data)))) => {
                        ws.send(tungstenite::Message::Pong(data)).await?;
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => return Err(SessionError::Ws(e)),
                    Err(_) => {
                        warn!("read timeout, connection considered dead");
                        return Err(SessionError::ConnectionClosed);
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use letschat_protocol::Operation;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use uuid::Uuid;

    /// An in-memory duplex used to drive `run_wire_loop` without a socket.
    struct MockTransport {
        incoming: VecDeque<Result<tungstenite::Message, tungstenite::Error>>,
        sent: Vec<tungstenite::Message>,
    }

    impl Stream for MockTransport {
        type Item = Result<tungstenite::Message, tungstenite::Error>;
        fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            match self.incoming.pop_front() {
                Some(item) => Poll::Ready(Some(item)),
                // Stay "open" once drained rather than signaling stream end,
                // so a test can still drive the outbound/shutdown branches.
                None => Poll::Pending,
            }
        }
    }

    impl Sink<tungstenite::Message> for MockTransport {
        type Error = tungstenite::Error;
        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn start_send(mut self: Pin<&mut Self>, item: tungstenite::Message) -> Result<(), Self::Error> {
            self.sent.push(item);
            Ok(())
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn sample_message() -> Message {
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

    #[tokio::test]
    async fn inbound_message_frame_is_forwarded_to_inbound_channel() {
        let frame = WsFrame::Message(sample_message());
        let text = serde_json::to_string(&frame).unwrap();
        let transport = MockTransport {
            incoming: VecDeque::from([
                Ok(tungstenite::Message::Text(text.into())),
                Ok(tungstenite::Message::Close(None)),
            ]),
            sent: Vec::new(),
        };
        let (_out_tx, out_rx) = mpsc::channel(8);
        let (_faf_tx, faf_rx) = mpsc::channel(8);
        let (in_tx, mut in_rx) = mpsc::channel(8);
        let (ack_tx, _ack_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        run_wire_loop(transport, "s1".to_owned(), out_rx, faf_rx, in_tx, ack_tx, shutdown_rx)
            .await
            .unwrap();

        let received = in_rx.try_recv().unwrap();
        assert_eq!(received.operation, Operation::Create);
    }

    #[tokio::test]
    async fn outgoing_message_is_written_and_acked() {
        let transport = MockTransport {
            incoming: VecDeque::new(),
            sent: Vec::new(),
        };
        let (out_tx, out_rx) = mpsc::channel(8);
        let (_faf_tx, faf_rx) = mpsc::channel(8);
        let (in_tx, _in_rx) = mpsc::channel(8);
        let (ack_tx, mut ack_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_wire_loop(
            transport,
            "s1".to_owned(),
            out_rx,
            faf_rx,
            in_tx,
            ack_tx,
            shutdown_rx,
        ));
        out_tx.send(sample_message()).await.unwrap();
        assert!(ack_rx.recv().await.unwrap());
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_loop() {
        let transport = MockTransport {
            incoming: VecDeque::new(),
            sent: Vec::new(),
        };
        let (_out_tx, out_rx) = mpsc::channel(8);
        let (_faf_tx, faf_rx) = mpsc::channel(8);
        let (in_tx, _in_rx) = mpsc::channel(8);
        let (ack_tx, _ack_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        let result = run_wire_loop(transport, "s1".to_owned(), out_rx, faf_rx, in_tx, ack_tx, shutdown_rx).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn non_retryable_error_frame_terminates_the_session() {
        let frame = WsFrame::Error(letschat_protocol::ErrorMessage {
            code: letschat_protocol::error_codes::INVALID_TOKEN.to_owned(),
            message: "bad token".to_owned(),
            retryable: false,
        });
        let text = serde_json::to_string(&frame).unwrap();
        let transport = MockTransport {
            incoming: VecDeque::from([Ok(tungstenite::Message::Text(text.into()))]),
            sent: Vec::new(),
        };
        let (_out_tx, out_rx) = mpsc::channel(8);
        let (_faf_tx, faf_rx) = mpsc::channel(8);
        let (in_tx, _in_rx) = mpsc::channel(8);
        let (ack_tx, _ack_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = run_wire_loop(transport, "s1".to_owned(), out_rx, faf_rx, in_tx, ack_tx, shutdown_rx).await;
        assert!(matches!(result, Err(SessionError::ConnectionClosed)));
    }

    /// A frame pushed onto `fire_and_forget` must not consume (or require)
    /// an `acks` slot — the whole point of the split channel.
    #[tokio::test]
    async fn fire_and_forget_frame_is_written_without_touching_acks() {
        let transport = MockTransport {
            incoming: VecDeque::new(),
            sent: Vec::new(),
        };
        let (_out_tx, out_rx) = mpsc::channel(8);
        let (faf_tx, faf_rx) = mpsc::channel(8);
        let (in_tx, _in_rx) = mpsc::channel(8);
        let (ack_tx, mut ack_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_wire_loop(
            transport,
            "s1".to_owned(),
            out_rx,
            faf_rx,
            in_tx,
            ack_tx,
            shutdown_rx,
        ));

        for _ in 0..4 {
            faf_tx.send(sample_message()).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(ack_rx.try_recv().is_err(), "fire-and-forget sends must not produce an ack");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
