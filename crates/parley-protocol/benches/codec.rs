//! Codec benchmarks for parley-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_protocol::{codec, ClientEvent, Encoding, MediaKind, ServerEvent, UserId};
use serde_json::json;

fn offer_event() -> ServerEvent {
    ServerEvent::CallOffer {
        call_id: "call-123".into(),
        chat_id: "chat-abc".into(),
        caller_id: UserId(1),
        caller_name: "alice".into(),
        caller_avatar: None,
        call_type: MediaKind::Video,
        offer: json!({"type": "offer", "sdp": "v=0\r\n".repeat(64)}),
    }
}

fn bench_encode_offer(c: &mut Criterion) {
    let event = offer_event();

    let mut group = c.benchmark_group("encode");
    group.bench_function("offer_text", |b| {
        b.iter(|| codec::encode(black_box(&event), Encoding::Text))
    });
    group.bench_function("offer_binary", |b| {
        b.iter(|| codec::encode(black_box(&event), Encoding::Binary))
    });
    group.finish();
}

fn bench_decode_message(c: &mut Criterion) {
    let text = r#"{"type":"send_message","chatId":"chat-abc","content":"hello there","tempId":"t-1"}"#;
    let binary = codec::encode_binary(&ClientEvent::SendMessage {
        chat_id: "chat-abc".into(),
        content: "hello there".into(),
        temp_id: Some(json!("t-1")),
    })
    .unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("send_message_text", |b| {
        b.iter(|| codec::decode_text(black_box(text)))
    });
    group.bench_function("send_message_binary", |b| {
        b.iter(|| codec::decode_binary(black_box(&binary)))
    });
    group.finish();
}

criterion_group!(benches, bench_encode_offer, bench_decode_message);
criterion_main!(benches);
