use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use meridian_sync::presence::user_color;
use meridian_sync::protocol::{encode_update_frame, update_payload, ControlMessage, Outbound};
use meridian_sync::{Peer, PeerId, Room, RoomKey};
use uuid::Uuid;
use yrs::{Doc, Text, Transact};

struct CountingPeer {
    id: PeerId,
    received: AtomicUsize,
}

impl Peer for CountingPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn send(&self, _frame: Outbound) -> bool {
        self.received.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn close(&self) {}
}

fn small_update(client_id: u64) -> Vec<u8> {
    let doc = Doc::with_client_id(client_id);
    let text = doc.get_or_insert_text("body");
    let mut txn = doc.transact_mut();
    text.insert(&mut txn, 0, "hello world");
    txn.encode_update_v1()
}

fn bench_frame_validation(c: &mut Criterion) {
    let frame = encode_update_frame(&small_update(1));

    c.bench_function("frame_validate", |b| {
        b.iter(|| {
            black_box(update_payload(black_box(&frame)).unwrap());
        })
    });
}

fn bench_control_parse(c: &mut Criterion) {
    let json = r##"{"type":"awareness","clientId":42,"state":{"user":{"id":"u1","name":"Ada","color":"#ff0000"},"cursor":{"x":10.0,"y":20.0}}}"##;

    c.bench_function("control_parse_awareness", |b| {
        b.iter(|| {
            black_box(serde_json::from_str::<ControlMessage>(black_box(json)).unwrap());
        })
    });
}

fn bench_room_fan_out(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let room = Room::new(RoomKey::parse("text", "bench").unwrap());
    let peers: Vec<Arc<CountingPeer>> = (0..100)
        .map(|_| {
            Arc::new(CountingPeer {
                id: Uuid::new_v4(),
                received: AtomicUsize::new(0),
            })
        })
        .collect();
    runtime.block_on(async {
        for peer in &peers {
            room.join(peer.clone()).await.unwrap();
        }
    });
    let sender = peers[0].id;
    let mut client_id = 1u64;

    c.bench_function("room_apply_fan_out_100_peers", |b| {
        b.iter(|| {
            client_id += 1;
            let frame = encode_update_frame(&small_update(client_id));
            runtime.block_on(async {
                black_box(room.apply_update(sender, frame).await.unwrap());
            });
        })
    });
}

fn bench_user_color(c: &mut Criterion) {
    c.bench_function("user_color", |b| {
        b.iter(|| black_box(user_color(black_box("user-1234"))))
    });
}

criterion_group!(
    benches,
    bench_frame_validation,
    bench_control_parse,
    bench_room_fan_out,
    bench_user_color,
);
criterion_main!(benches);
