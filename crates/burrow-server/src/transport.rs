//! Per-control message transporter.
//!
//! Other subsystems (the NAT-hole controller in particular) talk to a
//! client through its control connection: fire-and-forget sends, plus
//! request/response exchanges correlated by message type and a lane key.

use crate::error::{Result, ServerError};
use burrow_proto::msg::Message;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub struct MessageTransporter {
    sender: mpsc::Sender<Message>,
    lanes: Mutex<HashMap<(u8, String), oneshot::Sender<Message>>>,
}

impl MessageTransporter {
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Self {
            sender,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a message onto the control connection.  A full send queue is an
    /// error, not a stall.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ServerError::ResourceUnavailable("control send queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => ServerError::ControlClosed,
        })
    }

    /// Send `req` and wait for the peer's reply of `expect_type` on
    /// `lane_key`.
    pub async fn request(
        &self,
        req: Message,
        expect_type: u8,
        lane_key: &str,
        timeout: Duration,
    ) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        let key = (expect_type, lane_key.to_string());
        self.lanes.lock().unwrap().insert(key.clone(), tx);

        if let Err(e) = self.send(req) {
            self.lanes.lock().unwrap().remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => {
                self.lanes.lock().unwrap().remove(&key);
                Err(ServerError::ControlClosed)
            }
            Err(_) => {
                self.lanes.lock().unwrap().remove(&key);
                Err(ServerError::ProtocolViolation(
                    "timed out waiting for peer reply".to_string(),
                ))
            }
        }
    }

    /// Hand an inbound message to a waiting `request` call.  Returns false
    /// when nobody is waiting on that (type, lane).
    pub fn dispatch(&self, msg: Message, lane_key: &str) -> bool {
        let key = (msg.type_byte(), lane_key.to_string());
        match self.lanes.lock().unwrap().remove(&key) {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::msg::{kind, NatHoleClient};

    #[tokio::test]
    async fn test_request_resolved_by_dispatch() {
        let (tx, mut rx) = mpsc::channel(10);
        let transporter = std::sync::Arc::new(MessageTransporter::new(tx));

        let t2 = std::sync::Arc::clone(&transporter);
        let waiter = tokio::spawn(async move {
            t2.request(
                Message::NatHoleClient(NatHoleClient {
                    proxy_name: "x".into(),
                    sid: "s1".into(),
                    ..NatHoleClient::default()
                }),
                kind::NAT_HOLE_CLIENT,
                "s1",
                Duration::from_secs(1),
            )
            .await
        });

        // The request itself goes out on the control channel.
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.type_byte(), kind::NAT_HOLE_CLIENT);

        // Peer reply arrives on the same lane.
        let delivered = transporter.dispatch(
            Message::NatHoleClient(NatHoleClient {
                proxy_name: "x".into(),
                sid: "s1".into(),
                ..NatHoleClient::default()
            }),
            "s1",
        );
        assert!(delivered);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (tx, _rx) = mpsc::channel(10);
        let transporter = MessageTransporter::new(tx);
        let result = transporter
            .request(
                Message::NatHoleClient(NatHoleClient::default()),
                kind::NAT_HOLE_CLIENT,
                "nobody",
                Duration::from_millis(20),
            )
            .await;
        assert!(result.is_err());
        // Lane is cleaned up afterwards.
        assert!(!transporter.dispatch(Message::NatHoleClient(NatHoleClient::default()), "nobody"));
    }

    #[tokio::test]
    async fn test_dispatch_without_waiter() {
        let (tx, _rx) = mpsc::channel(1);
        let transporter = MessageTransporter::new(tx);
        assert!(!transporter.dispatch(Message::NatHoleClient(NatHoleClient::default()), "s9"));
    }
}
