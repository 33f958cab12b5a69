//! Property tests for inbound frame decoding.
//!
//! The decoder sits on the session's read path, so it must never panic on
//! hostile input and must always echo the id it was given.

use hass_protocol::{decode_message, HubRequest, InboundFrame, OutgoingFrame};
use proptest::prelude::*;

proptest! {
    #[test]
    fn decoding_arbitrary_text_never_panics(text in ".{0,256}") {
        let frames = decode_message(&text);
        prop_assert!(!frames.is_empty() || text.trim_start().starts_with('['));
    }

    #[test]
    fn result_frames_echo_their_id(id in any::<u64>(), success in any::<bool>()) {
        let text = format!(r#"{{"id": {id}, "type": "result", "success": {success}, "result": null}}"#);
        let frames = decode_message(&text);
        prop_assert_eq!(frames.len(), 1);
        match &frames[0] {
            Ok(InboundFrame::Reply(reply)) => {
                prop_assert_eq!(reply.id, id);
                prop_assert_eq!(reply.success, success);
            }
            other => prop_assert!(false, "unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn state_changed_subject_survives_decoding(entity in "[a-z_]{1,12}\\.[a-z0-9_]{1,16}") {
        let text = serde_json::json!({
            "id": 1,
            "type": "event",
            "event": {
                "event_type": "state_changed",
                "data": {"entity_id": entity, "new_state": {"state": "on"}, "old_state": null}
            }
        })
        .to_string();

        let frames = decode_message(&text);
        match &frames[0] {
            Ok(InboundFrame::Event { event, .. }) => {
                prop_assert_eq!(event.subject.as_ref().map(|s| s.as_str()), Some(entity.as_str()));
            }
            other => prop_assert!(false, "unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn outgoing_frames_carry_their_id(id in any::<u64>()) {
        let text = OutgoingFrame::new(id, HubRequest::Ping).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(value["id"].as_u64(), Some(id));
    }
}
