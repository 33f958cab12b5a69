//! Event streaming for the `watch` command

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use hass_bridge::{EventFrame, Gateway, HandlerResult, SubjectFilter, SubjectId};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One printable line per event
pub fn format_event(event: &EventFrame) -> String {
    let fired: DateTime<Local> = event.time_fired.unwrap_or_else(Utc::now).into();
    let time = fired.format("%H:%M:%S%.3f");
    let subject = event
        .subject
        .as_ref()
        .map(|s| s.as_str())
        .unwrap_or("-");

    match (event.old_state_value(), event.new_state_value()) {
        (Some(old), Some(new)) => format!("{} {} {} -> {}", time, subject, old, new),
        (None, Some(new)) => format!("{} {} (new) -> {}", time, subject, new),
        (Some(old), None) => format!("{} {} {} -> (removed)", time, subject, old),
        (None, None) => format!("{} {} {} {}", time, event.kind, subject, event.data),
    }
}

/// Print matching events until Ctrl+C or `count` events
pub async fn watch_events(
    gateway: &Gateway,
    kind: &str,
    entity: Option<&str>,
    count: Option<usize>,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let filter = SubjectFilter::from(entity.map(SubjectId::from));

    let _guard = gateway.subscribe_scoped(kind, filter, move |event: &EventFrame| -> HandlerResult {
        tx.send(format_event(event))?;
        Ok(())
    });

    info!(kind, entity = entity.unwrap_or("*"), "Watching events");
    eprintln!("Watching {} events, Ctrl+C to stop", kind);

    let mut seen = 0usize;
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    println!("{}", line);
                    seen += 1;
                    if count.is_some_and(|limit| seen >= limit) {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted");
                break;
            }
        }
    }

    info!(seen, "Stopped watching");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hass_bridge::{EventKind, Value};
    use serde_json::json;

    fn frame(data: Value) -> EventFrame {
        let fired = "2024-06-01T12:00:00Z".parse().ok();
        EventFrame::from_raw("state_changed", data, Some("LOCAL".into()), fired)
    }

    #[test]
    fn test_format_state_change() {
        let event = frame(json!({
            "entity_id": "light.kitchen",
            "old_state": {"state": "off"},
            "new_state": {"state": "on"},
        }));
        assert_eq!(event.kind, EventKind::StateChanged);
        assert!(format_event(&event).ends_with("light.kitchen off -> on"));
    }

    #[test]
    fn test_format_other_event() {
        let event = EventFrame::from_raw("call_service", json!({"domain": "light"}), None, None);
        let line = format_event(&event);
        assert!(line.contains("call_service - "));
        assert!(line.contains(r#""domain":"light""#));
    }

    #[test]
    fn test_format_removed_entity() {
        let event = frame(json!({
            "entity_id": "sensor.gone",
            "old_state": {"state": "12"},
            "new_state": null,
        }));
        assert!(format_event(&event).ends_with("sensor.gone 12 -> (removed)"));
    }
}
