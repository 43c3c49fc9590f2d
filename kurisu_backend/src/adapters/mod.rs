//! Chat front-ends. Each adapter publishes inbound envelopes tagged with its
//! own origin and delivers only the replies carrying that origin.

pub mod telegram;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;

use crate::bus::{handler, Handler};
use crate::message::Envelope;

pub use telegram::TelegramAdapter;

/// Outbound listener that hands answered envelopes from `origin` to `deliver`
/// and ignores everything else.
pub fn replies_for<F, Fut>(origin: impl Into<String>, deliver: F) -> Handler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let origin: Arc<str> = Arc::from(origin.into());
    let deliver = Arc::new(deliver);
    handler(move |envelope: Envelope| {
        let origin = origin.clone();
        let deliver = deliver.clone();
        async move {
            if envelope.origin != *origin {
                return Ok(());
            }
            if envelope.response().is_none() {
                tracing::warn!("Outbound envelope {} has no response, skipping", envelope.id);
                return Ok(());
            }
            deliver(envelope).await
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Sender;
    use std::sync::Mutex;

    fn answered(origin: &str) -> Envelope {
        let mut envelope = Envelope::text(
            origin,
            Sender {
                id: "7".to_string(),
                name: "Okabe".to_string(),
            },
            "hi",
        );
        envelope.set_response("hello").unwrap();
        envelope
    }

    #[tokio::test]
    async fn delivers_only_own_answered_replies() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let listener = replies_for("console", move |envelope: Envelope| {
            let sink = sink.clone();
            async move {
                sink.lock()
                    .unwrap()
                    .push(envelope.response().unwrap_or_default().to_string());
                anyhow::Ok(())
            }
        });

        listener(answered("console")).await.unwrap();
        listener(answered("telegram")).await.unwrap();
        listener(Envelope::text(
            "console",
            Sender {
                id: "7".to_string(),
                name: "Okabe".to_string(),
            },
            "unanswered",
        ))
        .await
        .unwrap();

        assert_eq!(*delivered.lock().unwrap(), vec!["hello".to_string()]);
    }
}
