//! NDJSON message logs.
//!
//! Each non-empty line is one of:
//! - a bare event object;
//! - `{"relay": "wss://...", "event": {...}}`;
//! - a relay frame `["EVENT", "<subscription>", {...}]`.

use anyhow::{anyhow, bail, Context};
use pika_event_store::{Delivery, Incoming};
use serde_json::Value;

/// `Ok(None)` for blank lines and `#` comments.
pub fn parse_line(line: &str, default_relay: Option<&str>) -> anyhow::Result<Option<Delivery>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(line).context("line is not JSON")?;

    let (event, relay) = match value {
        Value::Array(mut frame) => {
            if frame.first().and_then(Value::as_str) != Some("EVENT") || frame.len() < 3 {
                bail!("only EVENT frames can be replayed");
            }
            (frame.swap_remove(2), None)
        }
        Value::Object(mut obj) => match obj.remove("event") {
            Some(event) => {
                let relay = obj.get("relay").and_then(Value::as_str).map(str::to_string);
                (event, relay)
            }
            None => (Value::Object(obj), None),
        },
        other => return Err(anyhow!("unexpected JSON value: {other}")),
    };

    let relay = relay.or_else(|| default_relay.map(str::to_string));
    Ok(Some((Incoming::Raw(event.to_string()), relay)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(delivery: &Delivery) -> &str {
        match &delivery.0 {
            Incoming::Raw(json) => json,
            Incoming::Parsed(_) => panic!("expected raw input"),
        }
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        assert!(parse_line("   ", None).unwrap().is_none());
        assert!(parse_line("# relay dump", None).unwrap().is_none());
    }

    #[test]
    fn envelope_relay_beats_default() {
        let d = parse_line(r#"{"relay":"wss://a","event":{"id":"x"}}"#, Some("wss://b"))
            .unwrap()
            .unwrap();
        assert_eq!(d.1.as_deref(), Some("wss://a"));
        assert_eq!(raw(&d), r#"{"id":"x"}"#);
    }

    #[test]
    fn bare_events_and_frames_take_default_relay() {
        let d = parse_line(r#"{"id":"x"}"#, Some("wss://b")).unwrap().unwrap();
        assert_eq!(d.1.as_deref(), Some("wss://b"));

        let d = parse_line(r#"["EVENT","sub",{"id":"y"}]"#, None)
            .unwrap()
            .unwrap();
        assert_eq!(d.1, None);
        assert_eq!(raw(&d), r#"{"id":"y"}"#);
    }

    #[test]
    fn rejects_other_frames_and_garbage() {
        assert!(parse_line(r#"["EOSE","sub"]"#, None).is_err());
        assert!(parse_line("42", None).is_err());
        assert!(parse_line("{nope", None).is_err());
    }
}
