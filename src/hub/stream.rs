//! Per-subscriber connection loop
//!
//! The loop runs in its own task and feeds the response body through a
//! channel of capacity one, so a write only completes once the previous
//! chunk has been taken by the HTTP stack.

use super::{Hub, HubConfig};
use crate::subscriber::Subscriber;
use crate::update::Update;
use axum::body::{Body, Bytes};
use futures::StreamExt;
use rand::Rng;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};

const HEARTBEAT: &str = ":\n";

/// Spawn the connection loop and return the SSE body it writes to
pub(super) fn spawn(hub: Hub, subscriber: Arc<Subscriber>, updates: mpsc::Receiver<Arc<Update>>) -> Body {
    let (body_tx, body_rx) = mpsc::channel::<Bytes>(1);

    tokio::spawn(async move {
        run(hub.config(), &subscriber, updates, body_tx).await;
        hub.shutdown(&subscriber).await;
    });

    // The leading comment makes proxies flush the headers right away
    let head = futures::stream::once(async { Bytes::from_static(HEARTBEAT.as_bytes()) });
    let chunks = futures::stream::unfold(body_rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) });

    Body::from_stream(head.chain(chunks).map(Ok::<_, Infallible>))
}

async fn run(
    config: &HubConfig,
    subscriber: &Subscriber,
    mut updates: mpsc::Receiver<Arc<Update>>,
    body: mpsc::Sender<Bytes>,
) {
    let heartbeat = (!config.heartbeat.is_zero()).then_some(config.heartbeat);
    let mut next_heartbeat = heartbeat.map(|h| Instant::now() + h);

    // Leave room for one last dispatch before the connection deadline
    let disconnect_at = write_deadline(config, subscriber).map(|d| {
        d.checked_sub(config.dispatch_timeout)
            .filter(|at| *at > Instant::now())
            .unwrap_or(d)
    });
    let disconnect = sleep_or_pending(disconnect_at);
    tokio::pin!(disconnect);

    loop {
        tokio::select! {
            _ = body.closed() => {
                tracing::debug!(subscriber_id = %subscriber.id, "Connection closed by the client");
                return;
            }
            _ = &mut disconnect => {
                tracing::debug!(subscriber_id = %subscriber.id, "Connection lifetime reached");
                return;
            }
            _ = sleep_or_pending(next_heartbeat) => {
                if !write(&body, Bytes::from_static(HEARTBEAT.as_bytes()), config.dispatch_timeout, subscriber).await {
                    return;
                }
            }
            update = updates.recv() => {
                // A closed channel means the subscriber was disconnected
                let Some(update) = update else {
                    return;
                };

                if !write(&body, Bytes::from(update.to_event()), config.dispatch_timeout, subscriber).await {
                    return;
                }
                tracing::debug!(subscriber_id = %subscriber.id, update_id = %update.id, "Update sent");
            }
        }

        next_heartbeat = heartbeat.map(|h| Instant::now() + h);
    }
}

async fn write(body: &mpsc::Sender<Bytes>, chunk: Bytes, dispatch_timeout: Duration, subscriber: &Subscriber) -> bool {
    if dispatch_timeout.is_zero() {
        return body.send(chunk).await.is_ok();
    }

    match timeout(dispatch_timeout, body.send(chunk)).await {
        Ok(result) => result.is_ok(),
        Err(_) => {
            tracing::info!(subscriber_id = %subscriber.id, "Dispatch timeout reached");
            false
        }
    }
}

async fn sleep_or_pending(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// End of the connection: `write_timeout` from now, or the token expiry if sooner.
///
/// Both are shortened to a random 80-100% so clients connected at the same
/// time do not all reconnect at once.
fn write_deadline(config: &HubConfig, subscriber: &Subscriber) -> Option<Instant> {
    let mut lifetime = (!config.write_timeout.is_zero()).then(|| randomize(config.write_timeout));

    if let Some(exp) = subscriber.claims.as_ref().and_then(|c| c.exp) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let until_expiry = Duration::from_secs(exp).saturating_sub(now);

        if lifetime.map_or(true, |l| until_expiry < l) {
            lifetime = Some(randomize(until_expiry));
        }
    }

    lifetime.map(|l| Instant::now() + l)
}

fn randomize(d: Duration) -> Duration {
    let max = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
    let min = max / 5 * 4;
    Duration::from_nanos(rand::rng().random_range(min..=max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Claims;
    use crate::topics::TopicSelectorStore;

    fn subscriber(claims: Option<Claims>) -> Subscriber {
        let (tx, _rx) = mpsc::channel(1);
        let mut s = Subscriber::new("", Arc::new(TopicSelectorStore::default()), tx);
        s.claims = claims;
        s
    }

    #[test]
    fn test_randomize_bounds() {
        let d = Duration::from_secs(100);
        for _ in 0..100 {
            let r = randomize(d);
            assert!(r >= Duration::from_secs(80) && r <= d, "{:?}", r);
        }
        assert_eq!(randomize(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_write_deadline_disabled() {
        let config = HubConfig {
            write_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(write_deadline(&config, &subscriber(None)).is_none());
    }

    #[tokio::test]
    async fn test_write_deadline_bounded_by_token_expiry() {
        let config = HubConfig::default();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let claims = Claims {
            exp: Some(now + 10),
            ..Default::default()
        };

        let deadline = write_deadline(&config, &subscriber(Some(claims))).unwrap();
        assert!(deadline <= Instant::now() + Duration::from_secs(11));

        let deadline = write_deadline(&config, &subscriber(None)).unwrap();
        assert!(deadline >= Instant::now() + Duration::from_secs(400));
    }

    #[tokio::test]
    async fn test_write_times_out_when_body_is_not_read() {
        let (tx, _rx) = mpsc::channel(1);
        let s = subscriber(None);

        assert!(write(&tx, Bytes::from_static(b"a"), Duration::from_millis(20), &s).await);
        assert!(!write(&tx, Bytes::from_static(b"b"), Duration::from_millis(20), &s).await);
    }

    #[tokio::test]
    async fn test_write_fails_when_client_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!write(&tx, Bytes::from_static(b"a"), Duration::ZERO, &subscriber(None)).await);
    }
}
