use criterion::{black_box, criterion_group, criterion_main, Criterion};
use skillbridge_relay::protocol::{Message, MessageKind, ParticipantRole, ServerEvent};
use skillbridge_relay::registry::{Participant, RoomChannel};
use skillbridge_relay::store::{MemoryMessageStore, MessageStore};
use std::sync::Arc;
use uuid::Uuid;

fn sample_message(room: Uuid) -> Message {
    Message {
        id: Uuid::new_v4(),
        room_id: room,
        sender_id: Uuid::new_v4(),
        kind: MessageKind::Text,
        content: "Thanks, that cleared things up — same time next week?".to_owned(),
        created_at: 1_700_000_000_000,
    }
}

fn bench_event_encode(c: &mut Criterion) {
    let event = ServerEvent::ReceiveMessage {
        message: sample_message(Uuid::new_v4()),
    };

    c.bench_function("event_encode_receive_message", |b| {
        b.iter(|| {
            black_box(black_box(&event).encode().unwrap());
        })
    });
}

fn bench_event_decode(c: &mut Criterion) {
    let event = ServerEvent::ReceiveMessage {
        message: sample_message(Uuid::new_v4()),
    };
    let encoded = event.encode().unwrap();

    c.bench_function("event_decode_receive_message", |b| {
        b.iter(|| {
            black_box(ServerEvent::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("fan_out_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let channel = RoomChannel::new(1024);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let member = Participant {
                        conn_id: Uuid::new_v4(),
                        user_id: Uuid::new_v4(),
                        name: format!("Member{i}"),
                        role: ParticipantRole::Learner,
                    };
                    receivers.push(channel.add_member(member).await);
                }

                let frame = Arc::new(
                    ServerEvent::Typing { room_id: Uuid::new_v4() }
                        .encode()
                        .unwrap(),
                );
                let origin = Uuid::new_v4();
                for _ in 0..100 {
                    black_box(channel.publish_raw(origin, frame.clone()));
                }
            })
        })
    });
}

fn bench_store_append(c: &mut Criterion) {
    let store = MemoryMessageStore::new();
    let room = Uuid::new_v4();
    let sender = Uuid::new_v4();

    c.bench_function("memory_store_append", |b| {
        b.iter(|| {
            black_box(
                store
                    .append(black_box(room), black_box(sender), MessageKind::Text, "hello")
                    .unwrap(),
            );
        })
    });
}

criterion_group!(
    benches,
    bench_event_encode,
    bench_event_decode,
    bench_fan_out,
    bench_store_append
);
criterion_main!(benches);
