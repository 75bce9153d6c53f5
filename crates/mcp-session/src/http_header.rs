//! Header and MIME constants of the streamable HTTP transport.

pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
pub const HEADER_LAST_EVENT_ID: &str = "Last-Event-ID";
pub const HEADER_X_ACCEL_BUFFERING: &str = "X-Accel-Buffering";

pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
pub const JSON_MIME_TYPE: &str = "application/json";
