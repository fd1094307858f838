// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Criterion benchmarks for the STOMP frame codec.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use labelbridge_stream::{Command, Frame};

fn job_message() -> Vec<u8> {
    let mut payload = String::from("^XA^PW812^LL1218");
    for line in 0..24 {
        payload.push_str(&format!("^FO40,{}^A0N,32,32^FDLine {line}^FS", 40 + line * 45));
    }
    payload.push_str("^XZ");
    let body = format!(r#"{{"targetPrinterId":3,"jobId":"order-1042","payload":"{payload}"}}"#);

    Frame::new(Command::Message)
        .with_header("destination", "/topic/print/42")
        .with_header("subscription", "sub-0")
        .with_header("message-id", "T_sub-0@@session-1@@17")
        .with_body(body)
        .encode()
}

fn bench_decode_message(c: &mut Criterion) {
    let raw = job_message();
    c.bench_function("decode_message_frame", |b| {
        b.iter(|| Frame::decode(black_box(&raw)))
    });
}

fn bench_encode_subscribe(c: &mut Criterion) {
    let frame = Frame::subscribe("sub-0", "/topic/print/42");
    c.bench_function("encode_subscribe_frame", |b| b.iter(|| black_box(&frame).encode()));
}

criterion_group!(benches, bench_decode_message, bench_encode_subscribe);
criterion_main!(benches);
