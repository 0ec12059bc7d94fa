//! Canonical-form round trips through the public `Dialect` API, and the
//! chat-upstream → messages-client streaming transformation end to end.

use plexus_protocol::sse::SseSplitter;
use plexus_transform::{
    Dialect, RawRequest, UnifiedStreamChunk, dialect::StreamIds, reconstruct_from_stream,
};

fn raw(body: &[u8]) -> RawRequest<'_> {
    RawRequest::body(body)
}

#[test]
fn chat_and_responses_requests_are_fixed_points() {
    let chat_body = serde_json::json!({
        "model": "gpt-4",
        "messages": [
            {"role": "system", "content": "short answers"},
            {"role": "user", "content": "2+2?"}
        ],
        "temperature": 0.1,
        "stream": false
    })
    .to_string();
    let unified = Dialect::Chat.parse_request(raw(chat_body.as_bytes())).unwrap();
    let emitted = Dialect::Chat.emit_request(&unified).unwrap();
    assert_eq!(unified, Dialect::Chat.parse_request(raw(&emitted)).unwrap());

    let responses_body = serde_json::json!({
        "model": "gpt-5",
        "input": [{"type": "message", "role": "user", "content": "2+2?"}],
        "reasoning": {"max_tokens": 100}
    })
    .to_string();
    let unified = Dialect::Responses
        .parse_request(raw(responses_body.as_bytes()))
        .unwrap();
    let emitted = Dialect::Responses.emit_request(&unified).unwrap();
    assert_eq!(
        unified,
        Dialect::Responses.parse_request(raw(&emitted)).unwrap()
    );
}

#[test]
fn messages_and_gemini_requests_are_fixed_points() {
    let messages_body = serde_json::json!({
        "model": "claude-sonnet-4",
        "max_tokens": 100,
        "system": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}],
        "messages": [{"role": "user", "content": [
            {"type": "text", "text": "look"},
            {"type": "image", "source": {"type": "base64",
                "media_type": "image/jpeg", "data": "Zm9v"}}
        ]}],
        "stop_sequences": ["STOP"]
    })
    .to_string();
    let unified = Dialect::Messages
        .parse_request(raw(messages_body.as_bytes()))
        .unwrap();
    let emitted = Dialect::Messages.emit_request(&unified).unwrap();
    assert_eq!(
        unified,
        Dialect::Messages.parse_request(raw(&emitted)).unwrap()
    );

    let gemini_body = serde_json::json!({
        "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
        "generationConfig": {"maxOutputTokens": 50, "stopSequences": ["x"]}
    })
    .to_string();
    let gemini_raw = RawRequest {
        body: gemini_body.as_bytes(),
        path_model: Some("models/gemini-2.0-flash"),
        path_stream: false,
    };
    let unified = Dialect::Gemini.parse_request(gemini_raw).unwrap();
    let emitted = Dialect::Gemini.emit_request(&unified).unwrap();
    let reparsed = Dialect::Gemini
        .parse_request(RawRequest {
            body: &emitted,
            path_model: Some("models/gemini-2.0-flash"),
            path_stream: false,
        })
        .unwrap();
    assert_eq!(unified, reparsed);
}

#[test]
fn delta_concatenation_matches_reconstruction() {
    let raw_sse = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"a\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"bc\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"d\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    let mut splitter = SseSplitter::new();
    let mut decoder = Dialect::Chat.decoder();
    let mut concatenated = String::new();
    let mut frames = splitter.push_str(raw_sse);
    frames.extend(splitter.finish());
    for frame in &frames {
        for chunk in decoder.push(frame).unwrap() {
            if let UnifiedStreamChunk::DeltaText { text } = chunk {
                concatenated.push_str(&text);
            }
        }
    }

    let reconstructed = reconstruct_from_stream(Dialect::Chat, raw_sse.as_bytes()).unwrap();
    assert_eq!(concatenated, reconstructed.joined_text());
    assert_eq!(concatenated, "abcd");
}

/// A provider speaking chat streams through the gateway to a client that
/// asked in the messages dialect: named events out, `message_stop` last.
#[test]
fn chat_upstream_becomes_messages_client_stream() {
    let upstream = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hi\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\" there\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],",
        "\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":3,\"total_tokens\":15}}\n\n",
        "data: [DONE]\n\n",
    );

    let mut splitter = SseSplitter::new();
    let mut decoder = Dialect::Chat.decoder();
    let mut encoder = Dialect::Messages.encoder(StreamIds {
        response_id: "msg_x".into(),
        model: "sonnet-mirror".into(),
        created: 0,
    });

    let mut events = Vec::new();
    let mut frames = splitter.push_str(upstream);
    frames.extend(splitter.finish());
    for frame in &frames {
        for chunk in decoder.push(frame).unwrap() {
            events.extend(encoder.encode(&chunk));
        }
    }
    events.extend(encoder.finish());

    let names: Vec<_> = events.iter().filter_map(|f| f.event.clone()).collect();
    assert_eq!(names.first().map(String::as_str), Some("message_start"));
    assert_eq!(names.last().map(String::as_str), Some("message_stop"));
    assert!(names.iter().any(|n| n == "content_block_delta"));

    let delta_frame = events
        .iter()
        .find(|f| f.event.as_deref() == Some("message_delta"))
        .unwrap();
    assert!(delta_frame.data.contains("\"input_tokens\":12"));
    assert!(delta_frame.data.contains("\"output_tokens\":3"));
    assert!(delta_frame.data.contains("\"end_turn\""));
}
