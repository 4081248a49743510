//! Delivery through a local download agent over WebSocket.
//!
//! The client sends `config`, a stream of `link` messages and `complete`;
//! the agent answers with acks and may ask for fresh URLs at any time. A
//! session ends cleanly only on the agent's `job_complete` ack.

pub mod limiter;
pub mod message;
pub mod outbound;
pub mod protocol;
pub mod session;

use std::cmp::Ordering;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};

pub use limiter::SlidingWindow;
pub use message::{AckData, AckStatus, ClientMessage, DownloadMode, parse_agent_message};
pub use outbound::Outbound;
pub use protocol::{ProtocolGuard, ProtocolState, TranscriptEntry, validate_transcript};
pub use session::{AgentSession, AgentSummary};

fn version_parts(version: &str) -> Vec<u64> {
    version
        .trim()
        .trim_start_matches(['v', 'V'])
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Compares dotted versions numerically; missing parts count as zero.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a, b) = (version_parts(a), version_parts(b));
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            x.cmp(&y)
        })
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// True if `found` is `required` or newer.
#[must_use]
pub fn version_at_least(found: &str, required: &str) -> bool {
    compare_versions(found, required).is_ge()
}

/// Asks the agent at `host:port` for its version without starting a job.
///
/// # Errors
///
/// Returns [`Error::WebSocket`] if the agent is unreachable, closes early,
/// or does not answer within `timeout`.
pub async fn query_version(host: &str, port: u16, timeout: Duration) -> Result<String> {
    let url = format!("ws://{host}:{port}");
    let exchange = async {
        let (mut ws, _) = connect_async(url.as_str()).await?;
        let text = ClientMessage::VersionQuery {}.to_json()?;
        ws.send(Message::Text(text.into())).await?;
        while let Some(frame) = ws.next().await {
            let Message::Text(text) = frame? else {
                continue;
            };
            if let Ok(Some(ack)) = parse_agent_message(text.as_str())
                && ack.status == AckStatus::Success
                && ack.is_stage(message::stage::SERVER_INFO)
            {
                let _ = ws.close(None).await;
                return ack
                    .version
                    .ok_or_else(|| Error::WebSocket("agent did not report its version".into()));
            }
        }
        Err(Error::WebSocket(format!("agent at {url} closed before answering")))
    };
    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(Error::WebSocket(format!(
            "agent at {host}:{port} did not answer within {}ms",
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn versions_compare_numerically() {
        assert!(version_at_least("1.10.0", "1.9"));
        assert!(version_at_least("v2.0", "2.0.0"));
        assert!(version_at_least("1.2.0-beta", "1.2"));
        assert!(!version_at_least("1.0.3", "1.2"));
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
    }

    #[tokio::test]
    async fn version_query_reads_server_info() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let agent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let Some(Ok(Message::Text(text))) = ws.next().await else {
                panic!("expected a version query");
            };
            assert!(text.as_str().contains(message::VERSION_QUERY_TYPE));
            let ack = serde_json::json!({
                "type": message::ACK_TYPE,
                "data": {"status": "success", "stage": "server_info", "version": "3.4.1"}
            });
            ws.send(Message::Text(ack.to_string().into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });
        let version = query_version("127.0.0.1", port, Duration::from_secs(2)).await.unwrap();
        assert_eq!(version, "3.4.1");
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn version_query_times_out_on_silent_agent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });
        let err = query_version("127.0.0.1", port, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WebSocket(_)));
    }
}
