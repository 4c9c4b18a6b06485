//! `eval`: read-only inspection of a session snapshot.
//!
//! The snapshot is serialised to JSON and walked by a dotted path
//! (`current.song.title`, `history.entries.0.song.id`).  The feed client's
//! state sits under `feed`.  Nothing here can reach the live session.

use listen_proto::session::{FeedState, Session};
use listen_proto::ClientError;
use serde_json::Value;

pub fn eval_path(snapshot: &Session, feed: &FeedState, path: &str) -> Result<Value, ClientError> {
    let mut root = serde_json::to_value(snapshot)?;
    if let Value::Object(map) = &mut root {
        map.insert("feed".to_string(), serde_json::to_value(feed)?);
    }
    let mut node = &root;
    for segment in path.split('.').map(str::trim).filter(|s| !s.is_empty()) {
        let next = match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        node = next.ok_or_else(|| ClientError::NotFound {
            kind: "path",
            id: path.to_string(),
        })?;
    }
    Ok(node.clone())
}

pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
