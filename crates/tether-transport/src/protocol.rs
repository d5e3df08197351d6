//! Wire protocol helpers shared by the session client and controllers.

use serde_json::json;
use tether_core::{Envelope, InstanceId, envelope::kinds};
use url::Url;

/// Path prefix under which a controller accepts sessions.
pub const SESSION_PATH: &str = "session";

/// Address of the session endpoint for `instance` under `base`.
///
/// Any path already on `base` is kept; `/session/<id>` is appended.
#[must_use]
pub fn session_url(base: &Url, instance: &InstanceId) -> Url {
    let mut url = base.clone();
    let path = format!(
        "{}/{SESSION_PATH}/{instance}",
        base.path().trim_end_matches('/')
    );
    url.set_path(&path);
    url
}

/// Session id carried in a `/session/<id>` request path.
#[must_use]
pub fn session_id_from_path(path: &str) -> Option<&str> {
    let mut segments = path.trim_matches('/').rsplitn(2, '/');
    let id = segments.next()?;
    let prefix = segments.next()?;
    (prefix.rsplit('/').next() == Some(SESSION_PATH) && !id.is_empty()).then_some(id)
}

/// Handshake opener sent on every new connection.
#[must_use]
pub fn hello(instance: &InstanceId) -> Envelope {
    Envelope::new(kinds::HELLO).with_field("instanceId", instance.to_string())
}

/// Handshake acknowledgement sent by controllers.
#[must_use]
pub fn hello_ack(session_id: &str) -> Envelope {
    Envelope::new(kinds::HELLO_ACK).with_session(session_id)
}

/// Liveness probe.
#[must_use]
pub fn ping() -> Envelope {
    Envelope::new(kinds::PING)
}

/// Liveness answer.
#[must_use]
pub fn pong() -> Envelope {
    Envelope::new(kinds::PONG)
}

/// Reply to a correlated command whose handler failed.
#[must_use]
pub fn error_response(id: &str, message: &str) -> Envelope {
    Envelope::response(id, json!({ "success": false, "error": message }))
}
