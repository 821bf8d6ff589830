//! Message channel between worker contexts and the broker.
//!
//! Workers never share memory with the broker: every interaction is a
//! [`BrokerRequest`] pushed onto the broker's inbound queue. Requests carry a
//! oneshot reply slot and are bounded by a round-trip timeout; notifications
//! carry none and are bounded only by the time it takes to enqueue them.

mod messages;

pub use messages::{ACTIONS, BrokerRequest, BrokerResponse, RoutingDecision, SessionDescriptor};

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::broker::Control;
use crate::config::WorkerConfig;
use crate::error::{Error, Result};

/// Item on the broker's inbound queue
pub(crate) enum Envelope {
    /// Protocol command from a worker; `reply` is `None` for notifications
    Request {
        request: BrokerRequest,
        reply: Option<oneshot::Sender<Result<BrokerResponse>>>,
    },
    /// Command from the owning process (ingest, target registry, shutdown-time queries)
    Control(Control),
}

/// Asynchronous, timeout-bound transport to the broker
#[async_trait::async_trait]
pub trait MessageChannel: Send + Sync {
    /// Send a request and wait for its response.
    ///
    /// Fails with [`Error::ChannelTimeout`] when no response arrives in time
    /// and [`Error::NoResponder`] when the broker is gone.
    async fn request(&self, request: BrokerRequest) -> Result<BrokerResponse>;

    /// Enqueue a fire-and-forget notification.
    async fn notify(&self, request: BrokerRequest) -> Result<()>;
}

/// In-process [`MessageChannel`] backed by the broker reactor's queue
#[derive(Clone)]
pub struct ChannelClient {
    tx: mpsc::Sender<Envelope>,
    request_timeout: Duration,
    notify_timeout: Duration,
}

impl ChannelClient {
    pub(crate) fn new(tx: mpsc::Sender<Envelope>, config: &WorkerConfig) -> Self {
        Self {
            tx,
            request_timeout: config.request_timeout,
            notify_timeout: config.notify_timeout,
        }
    }
}

#[async_trait::async_trait]
impl MessageChannel for ChannelClient {
    async fn request(&self, request: BrokerRequest) -> Result<BrokerResponse> {
        let action = request.action();
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope::Request {
            request,
            reply: Some(reply_tx),
        };

        let round_trip = async {
            self.tx.send(envelope).await.map_err(|_| no_responder(action))?;
            reply_rx.await.map_err(|_| no_responder(action))?
        };

        match tokio::time::timeout(self.request_timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    action,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "Broker request timed out"
                );
                Err(Error::ChannelTimeout {
                    action: action.to_string(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn notify(&self, request: BrokerRequest) -> Result<()> {
        let action = request.action();
        let envelope = Envelope::Request {
            request,
            reply: None,
        };
        match tokio::time::timeout(self.notify_timeout, self.tx.send(envelope)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(no_responder(action)),
            Err(_) => Err(Error::ChannelTimeout {
                action: action.to_string(),
                timeout_ms: self.notify_timeout.as_millis() as u64,
            }),
        }
    }
}

fn no_responder(action: &str) -> Error {
    Error::NoResponder {
        action: action.to_string(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileId, SessionId};

    fn config(timeout_ms: u64) -> WorkerConfig {
        WorkerConfig {
            request_timeout: Duration::from_millis(timeout_ms),
            notify_timeout: Duration::from_millis(timeout_ms),
            ..WorkerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_when_nobody_answers() {
        let (tx, _rx) = mpsc::channel(4);
        let client = ChannelClient::new(tx, &config(200));

        let err = client
            .request(BrokerRequest::GetMetadata { file_id: FileId(1) })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            Error::ChannelTimeout {
                action: "getMetadata".into(),
                timeout_ms: 200
            }
        );
    }

    #[tokio::test]
    async fn request_fails_fast_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let client = ChannelClient::new(tx, &config(1_000));

        let err = client
            .request(BrokerRequest::QueryCompletion {
                session_id: SessionId(1),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoResponder { action } if action == "queryCompletion"));
    }

    #[tokio::test]
    async fn dropped_reply_slot_is_no_responder() {
        let (tx, mut rx) = mpsc::channel(4);
        let client = ChannelClient::new(tx, &config(1_000));

        let responder = tokio::spawn(async move {
            // Receive and drop without answering
            let _ = rx.recv().await;
        });
        let err = client
            .request(BrokerRequest::GetMetadata { file_id: FileId(2) })
            .await
            .unwrap_err();
        responder.await.unwrap();
        assert!(matches!(err, Error::NoResponder { .. }));
    }

    #[tokio::test]
    async fn request_returns_broker_reply() {
        let (tx, mut rx) = mpsc::channel(4);
        let client = ChannelClient::new(tx, &config(1_000));

        tokio::spawn(async move {
            if let Some(Envelope::Request {
                reply: Some(reply), ..
            }) = rx.recv().await
            {
                let _ = reply.send(Ok(BrokerResponse::Completion { complete: true }));
            }
        });

        let response = client
            .request(BrokerRequest::QueryCompletion {
                session_id: SessionId(5),
            })
            .await
            .unwrap();
        assert_eq!(response, BrokerResponse::Completion { complete: true });
    }

    #[tokio::test]
    async fn notify_enqueues_without_reply_slot() {
        let (tx, mut rx) = mpsc::channel(4);
        let client = ChannelClient::new(tx, &config(1_000));

        client
            .notify(BrokerRequest::EndSession {
                session_id: SessionId(8),
            })
            .await
            .unwrap();

        match rx.recv().await {
            Some(Envelope::Request { request, reply }) => {
                assert!(reply.is_none());
                assert_eq!(request.action(), "endSession");
            }
            _ => panic!("expected a request envelope"),
        }
    }
}
