//! Bounded-retry event fetching from upstream relays.

use std::{future::Future, time::Duration};

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::event::Event;

/// Bounded retry schedule for polling operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts before giving up.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    /// Six attempts spaced 800 ms apart, sized for relay propagation lag.
    fn default() -> Self {
        Self {
            max_attempts: 6,
            interval: Duration::from_millis(800),
        }
    }
}

/// Run `op` until it yields a value or the policy is exhausted.
///
/// Sleeps between attempts but not after the last one, so the caller's
/// request timeout can cancel the whole loop at any await point.
pub async fn retry_until_some<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for attempt in 1..=policy.max_attempts {
        if let Some(value) = op().await {
            return Some(value);
        }
        if attempt < policy.max_attempts {
            sleep(policy.interval).await;
        }
    }
    None
}

/// Injected capability to look up a signed event by id.
#[allow(async_fn_in_trait)]
pub trait EventSource {
    /// Best-effort single lookup across `relays`; retries are layered on top.
    async fn fetch_event(&self, id: &str, relays: &[String]) -> Option<Event>;
}

/// Relay-backed [`EventSource`] speaking the Nostr `REQ` protocol.
#[derive(Debug, Clone)]
pub struct RelaySource {
    /// Optional SOCKS5 proxy (host:port) for all relay connections.
    pub tor_socks: Option<String>,
    /// Bound on each relay lookup, connection included. A relay that
    /// accepts and goes silent must not stall the whole claim.
    pub timeout: Duration,
}

impl Default for RelaySource {
    fn default() -> Self {
        Self {
            tor_socks: None,
            timeout: Duration::from_secs(10),
        }
    }
}

impl EventSource for RelaySource {
    async fn fetch_event(&self, id: &str, relays: &[String]) -> Option<Event> {
        for relay in relays {
            let attempt = fetch_from_relay(relay, id, self.tor_socks.as_deref());
            match timeout(self.timeout, attempt).await {
                Ok(Ok(Some(ev))) => return Some(ev),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => debug!(relay, error = %e, "relay lookup failed"),
                Err(_) => debug!(relay, "relay lookup timed out"),
            }
        }
        None
    }
}

/// Subscribe to one relay for a single event id and wait for EVENT or EOSE.
async fn fetch_from_relay(
    relay: &str,
    id: &str,
    tor_socks: Option<&str>,
) -> Result<Option<Event>> {
    let mut ws = connect_ws(relay, tor_socks).await?;
    let req = json!(["REQ", "fetch", { "ids": [id] }]);
    ws.send(Message::Text(req.to_string())).await?;
    let mut found = None;
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(txt) => {
                if let Ok(val) = serde_json::from_str::<Value>(&txt) {
                    if let Some(arr) = val.as_array() {
                        match arr.first().and_then(|v| v.as_str()) {
                            Some("EVENT") if arr.len() >= 3 => {
                                if let Ok(ev) = serde_json::from_value::<Event>(arr[2].clone()) {
                                    // Relays are untrusted: only accept the id we asked for.
                                    if ev.id.eq_ignore_ascii_case(id) {
                                        found = Some(ev);
                                        break;
                                    }
                                }
                            }
                            Some("EOSE") => break,
                            _ => {}
                        }
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    let _ = ws.send(Message::Close(None)).await;
    Ok(found)
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(
    relay: &str,
    tor_socks: Option<&str>,
) -> Result<WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    fn sample_event(id: &str) -> Event {
        Event {
            id: id.into(),
            pubkey: "p".into(),
            kind: 9735,
            created_at: 1,
            tags: vec![Tag(vec!["bolt11".into(), "lnbc1".into()])],
            content: String::new(),
            sig: String::new(),
        }
    }

    async fn spawn_relay(responses: Vec<serde_json::Value>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            for resp in responses {
                ws.send(TMsg::Text(resp.to_string())).await.unwrap();
            }
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn fetches_event_by_id() {
        let ev = sample_event("aa11");
        let relay = spawn_relay(vec![
            json!(["EVENT", "fetch", ev]),
            json!(["EOSE", "fetch"]),
        ])
        .await;
        let source = RelaySource::default();
        let got = source.fetch_event("aa11", &[relay]).await.unwrap();
        assert_eq!(got.id, "aa11");
    }

    #[tokio::test]
    async fn ignores_events_with_other_ids() {
        let relay = spawn_relay(vec![
            json!(["EVENT", "fetch", sample_event("bb22")]),
            json!(["EOSE", "fetch"]),
        ])
        .await;
        let source = RelaySource::default();
        assert!(source.fetch_event("aa11", &[relay]).await.is_none());
    }

    #[tokio::test]
    async fn falls_through_to_next_relay() {
        let empty = spawn_relay(vec![json!(["EOSE", "fetch"])]).await;
        let ev = sample_event("cc33");
        let full = spawn_relay(vec![
            json!(["EVENT", "fetch", ev]),
            json!(["EOSE", "fetch"]),
        ])
        .await;
        let source = RelaySource::default();
        let got = source
            .fetch_event("cc33", &["ws://127.0.0.1:1".into(), empty, full])
            .await
            .unwrap();
        assert_eq!(got.id, "cc33");
    }

    #[tokio::test]
    async fn silent_relay_lookup_is_bounded() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // swallow the subscription and never answer
            let _ = ws.next().await;
            sleep(Duration::from_secs(60)).await;
        });
        let source = RelaySource {
            timeout: Duration::from_millis(100),
            ..RelaySource::default()
        };
        let got = source
            .fetch_event("aa11", &[format!("ws://{addr}")])
            .await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let policy = RetryPolicy {
            max_attempts: 5,
            interval: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let result = retry_until_some(&policy, || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 2 {
                Some(7u32)
            } else {
                None
            }
        })
        .await;
        assert_eq!(result, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhausts_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            interval: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let result: Option<u32> = retry_until_some(&policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            None
        })
        .await;
        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connect_ws_invalid_url_errors() {
        assert!(super::connect_ws("not a url", None).await.is_err());
    }

    #[tokio::test]
    async fn connect_ws_unreachable_host_errors() {
        assert!(super::connect_ws("ws://127.0.0.1:1", None).await.is_err());
    }
}
