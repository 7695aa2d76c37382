//! Destination naming and broker URL derivation.
//!
//! The backend runs a simple broker with `/queue` for point-to-point
//! delivery and `/app` as the application prefix. Both naming conventions
//! and the URL derivation must match the backend byte-for-byte.

use uuid::Uuid;

/// Per-user inbox destination. Every message addressed to `user` (and the
/// server echo of every message sent by `user`) arrives here.
pub fn inbox_destination(user: Uuid) -> String {
    format!("/queue/messages/{user}")
}

/// Application destination for publishing a message from `sender` to
/// `receiver`.
pub fn send_destination(sender: Uuid, receiver: Uuid) -> String {
    format!("/app/messages/send/{sender}/{receiver}")
}

/// Derive the broker endpoint from the REST base URL.
///
/// The derivation is: trim one trailing `/`, strip a trailing `/api` path
/// suffix, swap the scheme to `ws`/`wss`, append the fixed `/ws` endpoint.
/// `http://localhost:8080/api` becomes `ws://localhost:8080/ws`.
pub fn broker_url(api_base_url: &str) -> String {
    let base = api_base_url.strip_suffix('/').unwrap_or(api_base_url);
    let base = base.strip_suffix("/api").unwrap_or(base);

    let swapped = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };

    format!("{swapped}/ws")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_destination() {
        let user: Uuid = "11111111-1111-1111-1111-111111111111".parse().unwrap();
        assert_eq!(
            inbox_destination(user),
            "/queue/messages/11111111-1111-1111-1111-111111111111"
        );
    }

    #[test]
    fn test_send_destination() {
        let a: Uuid = "11111111-1111-1111-1111-111111111111".parse().unwrap();
        let b: Uuid = "22222222-2222-2222-2222-222222222222".parse().unwrap();
        assert_eq!(
            send_destination(a, b),
            "/app/messages/send/11111111-1111-1111-1111-111111111111/22222222-2222-2222-2222-222222222222"
        );
    }

    #[test]
    fn test_broker_url_derivation() {
        assert_eq!(broker_url("http://localhost:8080/api"), "ws://localhost:8080/ws");
        assert_eq!(broker_url("http://localhost:8080/api/"), "ws://localhost:8080/ws");
        assert_eq!(broker_url("https://chat.example.com/api"), "wss://chat.example.com/ws");
        // No /api suffix to strip.
        assert_eq!(broker_url("http://localhost:8080"), "ws://localhost:8080/ws");
    }
}
