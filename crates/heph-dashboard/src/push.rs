use crate::error::SubscriptionError;
use crate::session::HostEvent;
use crate::subscription::PushDelivery;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use heph_core::push_wire::{decode_frame, PushFrame};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};
use url::Url;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Keeps a push subscription open against `ws_url`, forwarding decoded
/// deliveries to the host. Reconnects with backoff until the host goes away.
pub async fn run_push_loop(ws_url: Url, tx: mpsc::Sender<HostEvent>, max_frame_bytes: usize) {
    let mut backoff = INITIAL_BACKOFF;
    while !tx.is_closed() {
        let mut ws = match connect_async(ws_url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(err) => {
                warn!(event = "push_connect_error", url = %ws_url, error = %err);
                let reason = SubscriptionError::Connect(err.to_string());
                if tx.send(HostEvent::PushDisconnected(Some(reason))).await.is_err() {
                    break;
                }
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
        };
        backoff = INITIAL_BACKOFF;
        info!(event = "push_connected", url = %ws_url);
        if tx.send(HostEvent::PushConnected).await.is_err() {
            let _ = ws.close(None).await;
            break;
        }

        let result = stream_frames(&mut ws, &tx, max_frame_bytes).await;
        let _ = ws.close(None).await;
        match result {
            Ok(()) => break,
            Err(err) => {
                warn!(event = "push_disconnected", url = %ws_url, error = %err);
                if tx.send(HostEvent::PushDisconnected(Some(err))).await.is_err() {
                    break;
                }
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
    debug!(event = "push_loop_exit");
}

/// Reads frames until the connection ends. `Ok(())` means the host stopped
/// listening; any error means the caller should reconnect.
pub async fn stream_frames<S>(
    ws: &mut S,
    tx: &mpsc::Sender<HostEvent>,
    max_frame_bytes: usize,
) -> Result<(), SubscriptionError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = ws.next().await {
        let bytes = match message {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(_)) => return Err(SubscriptionError::Closed),
            Ok(_) => continue,
            Err(err) => return Err(SubscriptionError::Read(err.to_string())),
        };
        match decode_delivery(&bytes, max_frame_bytes) {
            Ok(Some(delivery)) => {
                if tx.send(HostEvent::Push(delivery)).await.is_err() {
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(err) => warn!(event = "push_frame_error", error = %err),
        }
    }
    Err(SubscriptionError::Closed)
}

fn decode_delivery(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<Option<PushDelivery>, SubscriptionError> {
    let frame: PushFrame = decode_frame(bytes, max_frame_bytes)?;
    let delivery = PushDelivery::from_frame(&frame, Utc::now())?;
    if delivery.is_none() {
        debug!(event = "push_frame_ignored", event_type = %frame.event_type);
    }
    Ok(delivery)
}

fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        next
    }
}
