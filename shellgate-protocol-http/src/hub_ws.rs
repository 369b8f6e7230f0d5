use futures::{SinkExt, StreamExt};
use poem::web::websocket::{Message, WebSocketStream};
use shellgate_core::{HubSubscription, Services};
use tracing::*;
use uuid::Uuid;

const CLOSE_POLICY_VIOLATION: u16 = 1008;

const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "[::1]"];

fn host_part(value: &str) -> &str {
    // "[::1]:8888" keeps the bracketed literal, "host:port" drops the port.
    if let Some(end) = value.find(']') {
        return &value[..=end];
    }
    value.split(':').next().unwrap_or(value)
}

/// Origin policy for WebSocket upgrades: allow same host (ports
/// ignored), loopback, and configured extra origins; reject the rest.
/// Requests without an Origin header are not browsers and pass.
pub fn origin_allowed(origin: Option<&str>, request_host: Option<&str>, allowed: &[String]) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    if allowed.iter().any(|a| a == origin) {
        return true;
    }
    let Ok(url) = url::Url::parse(origin) else {
        return false;
    };
    let Some(origin_host) = url.host_str() else {
        return false;
    };
    if LOOPBACK_HOSTS.contains(&origin_host) {
        return true;
    }
    match request_host {
        Some(host) => origin_host.eq_ignore_ascii_case(host_part(host)),
        None => false,
    }
}

/// Pumps hub messages for the subscribed streams out to the client. When
/// the hub drops the subscription (slow consumer) the connection is
/// closed with a policy-violation code instead of silently losing
/// messages.
pub async fn serve_hub(
    services: Services,
    user_id: Uuid,
    subscription: HubSubscription,
    socket: WebSocketStream,
) {
    let conn_id = subscription.conn_id;
    let mut receiver = subscription.receiver;
    let (mut sink, mut stream) = socket.split();

    debug!(%user_id, conn_id, "Hub connection open");
    loop {
        tokio::select! {
            message = receiver.recv() => match message {
                Some(message) => {
                    let Ok(text) = serde_json::to_string(&message) else {
                        continue;
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => {
                    // The hub dropped us for falling behind.
                    let _ = sink
                        .send(Message::Close(Some((
                            CLOSE_POLICY_VIOLATION.into(),
                            "subscriber too slow".to_owned(),
                        ))))
                        .await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => (),
            },
        }
    }

    services.hub.disconnect(conn_id).await;
    debug!(%user_id, conn_id, "Hub connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_host_is_allowed_ignoring_ports() {
        assert!(origin_allowed(
            Some("https://gateway.example.com"),
            Some("gateway.example.com:8888"),
            &[]
        ));
        assert!(origin_allowed(
            Some("https://gateway.example.com:3000"),
            Some("gateway.example.com"),
            &[]
        ));
    }

    #[test]
    fn loopback_is_allowed() {
        assert!(origin_allowed(
            Some("http://localhost:5173"),
            Some("gateway.example.com"),
            &[]
        ));
        assert!(origin_allowed(
            Some("http://127.0.0.1:8080"),
            Some("gateway.example.com"),
            &[]
        ));
    }

    #[test]
    fn foreign_origin_is_rejected() {
        assert!(!origin_allowed(
            Some("https://evil.example.org"),
            Some("gateway.example.com"),
            &[]
        ));
    }

    #[test]
    fn allow_list_admits_configured_origins() {
        let allowed = vec!["https://app.example.org".to_owned()];
        assert!(origin_allowed(
            Some("https://app.example.org"),
            Some("gateway.example.com"),
            &allowed
        ));
    }

    #[test]
    fn missing_origin_passes() {
        assert!(origin_allowed(None, Some("gateway.example.com"), &[]));
    }

    #[test]
    fn garbage_origin_is_rejected() {
        assert!(!origin_allowed(Some("not a url"), Some("host"), &[]));
    }
}
