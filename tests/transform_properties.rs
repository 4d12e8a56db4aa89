//! Property-based tests for the request transforms
//!
//! These tests check that the body transforms only touch what they claim to
//! and that the header chain always ends with the acquired token.

use chat_relay::proxy::headers::Headers;
use chat_relay::proxy::transforms::{
    flatten_content, inject_bearer_token, merge_headers, remove_null_tool_calls,
    rewrite_tool_roles, TOOL_ROLES,
};
use proptest::prelude::*;
use serde_json::{json, Value};

// Property test generators
mod generators {
    use super::*;

    pub fn role() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("user".to_string()),
            Just("assistant".to_string()),
            Just("system".to_string()),
            Just("tool".to_string()),
            Just("tool-call".to_string()),
            Just("tool-response".to_string()),
        ]
    }

    pub fn content() -> impl Strategy<Value = Value> {
        prop_oneof![
            "[a-z ]{0,20}".prop_map(Value::from),
            "[a-z ]{0,20}".prop_map(|text| json!([{"type": "text", "text": text}])),
            ("[a-z]{1,10}", "[a-z]{1,10}").prop_map(|(a, b)| json!([
                {"type": "text", "text": a},
                {"type": "text", "text": b}
            ])),
            Just(json!([{"type": "image_url", "image_url": {"url": "https://x/y.png"}}])),
            Just(Value::Null),
        ]
    }

    pub fn tool_calls() -> impl Strategy<Value = Option<Value>> {
        prop_oneof![
            Just(None),
            Just(Some(Value::Null)),
            Just(Some(json!([{"id": "call_1", "type": "function"}]))),
        ]
    }

    pub fn message() -> impl Strategy<Value = Value> {
        (role(), content(), tool_calls()).prop_map(|(role, content, tool_calls)| {
            let mut message = json!({"role": role, "content": content});
            if let Some(tool_calls) = tool_calls {
                message["tool_calls"] = tool_calls;
            }
            message
        })
    }

    pub fn chat_body() -> impl Strategy<Value = Value> {
        (proptest::collection::vec(message(), 0..8), any::<bool>()).prop_map(
            |(messages, stream)| json!({"model": "m", "stream": stream, "messages": messages}),
        )
    }

    pub fn headers() -> impl Strategy<Value = Headers> {
        proptest::collection::vec(("[A-Za-z][A-Za-z-]{0,12}", "[a-z0-9]{0,12}"), 0..6)
            .prop_map(|pairs| pairs.into_iter().collect())
    }
}

fn messages(body: &Value) -> &Vec<Value> {
    body["messages"].as_array().unwrap()
}

proptest! {
    #[test]
    fn prop_flatten_only_changes_single_text_parts(body in generators::chat_body()) {
        let flattened = flatten_content(&body);

        prop_assert_eq!(&flattened["model"], &body["model"]);
        prop_assert_eq!(messages(&flattened).len(), messages(&body).len());
        for (before, after) in messages(&body).iter().zip(messages(&flattened)) {
            prop_assert_eq!(&before["role"], &after["role"]);
            match before["content"].as_array().map(Vec::as_slice) {
                Some([part]) if part["type"] == "text"
                    && part["text"].as_str().is_some_and(|text| !text.is_empty()) =>
                {
                    prop_assert_eq!(&after["content"], &part["text"]);
                }
                _ => prop_assert_eq!(&before["content"], &after["content"]),
            }
        }
    }

    #[test]
    fn prop_flatten_is_idempotent(body in generators::chat_body()) {
        let once = flatten_content(&body);
        prop_assert_eq!(flatten_content(&once), once);
    }

    #[test]
    fn prop_no_tool_roles_remain(body in generators::chat_body()) {
        let rewritten = rewrite_tool_roles(&body);

        for (before, after) in messages(&body).iter().zip(messages(&rewritten)) {
            let role = before["role"].as_str().unwrap();
            if TOOL_ROLES.contains(&role) {
                prop_assert_eq!(&after["role"], "user");
            } else {
                prop_assert_eq!(&after["role"], &before["role"]);
            }
            prop_assert_eq!(&after["content"], &before["content"]);
        }
    }

    #[test]
    fn prop_only_null_tool_calls_are_removed(body in generators::chat_body()) {
        let cleaned = remove_null_tool_calls(&body);

        for (before, after) in messages(&body).iter().zip(messages(&cleaned)) {
            match before.get("tool_calls") {
                Some(Value::Null) => prop_assert!(after.get("tool_calls").is_none()),
                other => prop_assert_eq!(after.get("tool_calls"), other),
            }
        }
    }

    #[test]
    fn prop_token_wins_over_merged_and_inbound_authorization(
        inbound in generators::headers(),
        overrides in generators::headers(),
        inbound_auth in proptest::option::of("[a-zA-Z0-9 ]{1,20}"),
        merged_auth in proptest::option::of("[a-zA-Z0-9 ]{1,20}"),
        token in "[A-Za-z0-9._-]{1,40}",
    ) {
        let mut inbound = inbound;
        if let Some(value) = inbound_auth {
            inbound.insert("authorization", value);
        }
        let mut overrides = overrides;
        if let Some(value) = merged_auth {
            overrides.insert("AUTHORIZATION", value);
        }

        let mut headers = merge_headers(&inbound, &overrides);
        inject_bearer_token(&mut headers, &token);

        let expected = format!("Bearer {token}");
        prop_assert_eq!(headers.get("Authorization"), Some(expected.as_str()));
        let authorization_entries = headers
            .names()
            .filter(|name| name.eq_ignore_ascii_case("authorization"))
            .count();
        prop_assert_eq!(authorization_entries, 1);
    }

    #[test]
    fn prop_merged_headers_override_inbound(
        inbound in generators::headers(),
        overrides in generators::headers(),
    ) {
        let merged = merge_headers(&inbound, &overrides);

        for (name, value) in overrides.iter() {
            prop_assert_eq!(merged.get(name), Some(value));
        }
        for (name, value) in inbound.iter() {
            if !overrides.contains(name) {
                prop_assert_eq!(merged.get(name), Some(value));
            }
        }
    }
}
