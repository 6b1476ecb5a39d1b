//! Simple benchmarks for MQTT 3.x framing and packet encoding/decoding.
//!
//! Run with: cargo bench -p giztoy-mqtt3 --bench codec

use std::time::Instant;

use bytes::Bytes;
use giztoy_mqtt3::protocol::{
    BufferWriter, Codec, Connect, Frame, Packet, Publish, Subscribe, TopicFilter,
    decode_variable_int, encode_variable_int,
};
use giztoy_mqtt3::{ProtocolVersion, QoS};

const ITERATIONS: u32 = 100_000;

fn bench<F: FnMut()>(name: &str, mut f: F) {
    // Warmup
    for _ in 0..1000 {
        f();
    }

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        f();
    }
    let elapsed = start.elapsed();

    let per_op = elapsed / ITERATIONS;
    let ops_per_sec = if per_op.as_nanos() > 0 {
        1_000_000_000 / per_op.as_nanos()
    } else {
        0
    };

    println!(
        "{:40} {:>10.2?} per op, {:>12} ops/sec",
        name,
        per_op,
        format_number(ops_per_sec as u64)
    );
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        format!("{}", n)
    }
}

fn encode(codec: &Codec, packet: &Packet) -> Vec<u8> {
    let mut out = BufferWriter::new();
    codec.write_packet(packet, &mut out).unwrap();
    out.written().to_vec()
}

fn bench_variable_int() {
    println!("\n=== Remaining Length ===");

    let mut out = BufferWriter::new();
    for (label, value) in [
        ("encode 127 (1 byte)", 127u32),
        ("encode 16383 (2 bytes)", 16_383),
        ("encode 2097151 (3 bytes)", 2_097_151),
        ("encode 268435455 (4 bytes)", 268_435_455),
    ] {
        bench(label, || {
            out.reset();
            let _ = encode_variable_int(value, &mut out);
        });
    }

    let encoded: [(&str, &[u8]); 4] = [
        ("decode 127 (1 byte)", &[0x7F]),
        ("decode 16383 (2 bytes)", &[0xFF, 0x7F]),
        ("decode 2097151 (3 bytes)", &[0xFF, 0xFF, 0x7F]),
        ("decode 268435455 (4 bytes)", &[0xFF, 0xFF, 0xFF, 0x7F]),
    ];
    for (label, bytes) in encoded {
        bench(label, || {
            let _ = decode_variable_int(bytes);
        });
    }
}

fn bench_publish_packet() {
    println!("\n=== PUBLISH Packet ===");

    let codec = Codec::new(ProtocolVersion::V311);
    let mut out = BufferWriter::new();

    for (label, size) in [("100B", 100usize), ("1KB", 1024), ("10KB", 10 * 1024)] {
        let packet = Packet::Publish(Publish::new("test/topic", vec![0u8; size]));

        bench(&format!("encode {} payload", label), || {
            out.reset();
            let _ = codec.write_packet(&packet, &mut out);
        });

        let encoded = encode(&codec, &packet);
        bench(&format!("decode {} payload", label), || {
            if let Ok(Some((frame, _))) = Frame::parse(&encoded) {
                let _ = codec.decode(&frame);
            }
        });

        // The broker forwards without decoding; this is its whole cost.
        bench(&format!("forward {} frame", label), || {
            if let Ok(Some((frame, _))) = Frame::parse(&encoded) {
                out.reset();
                let _ = frame.write_to(&mut out);
            }
        });
    }
}

fn bench_split_frame() {
    println!("\n=== Frame Across Segments ===");

    let codec = Codec::new(ProtocolVersion::V311);
    let encoded = encode(
        &codec,
        &Packet::Publish(Publish::new("test/topic", vec![0u8; 1024])),
    );
    let (head, tail) = encoded.split_at(encoded.len() / 2);

    bench("parse 1KB contiguous", || {
        let _ = Frame::parse(&encoded);
    });
    bench("parse 1KB in two segments", || {
        let _ = Frame::parse_segments(&[head, tail]);
    });
}

fn bench_connect_packet() {
    println!("\n=== CONNECT Packet ===");

    let connect = Packet::Connect(Connect {
        client_id: "benchmark-client-12345".to_string(),
        keep_alive: 60,
        clean_session: true,
        username: Some("username".to_string()),
        password: Some(Bytes::from_static(b"password")),
        will: None,
    });

    for version in [ProtocolVersion::V310, ProtocolVersion::V311] {
        let codec = Codec::new(version);
        let mut out = BufferWriter::new();
        bench(&format!("encode CONNECT ({})", version), || {
            out.reset();
            let _ = codec.write_packet(&connect, &mut out);
        });

        let encoded = encode(&codec, &connect);
        bench(&format!("decode CONNECT ({})", version), || {
            if let Ok(Some((frame, _))) = Frame::parse(&encoded) {
                let _ = codec.decode(&frame);
            }
        });
    }
}

fn bench_subscribe_packet() {
    println!("\n=== SUBSCRIBE Packet ===");

    let codec = Codec::new(ProtocolVersion::V311);
    let packet = Packet::Subscribe(Subscribe {
        pkid: 1,
        filters: ["topic/1", "topic/2", "topic/3", "topic/+/wildcard", "topic/#"]
            .into_iter()
            .map(|f| TopicFilter::new(f, QoS::AtMostOnce))
            .collect(),
    });

    let mut out = BufferWriter::new();
    bench("encode SUBSCRIBE (5 topics)", || {
        out.reset();
        let _ = codec.write_packet(&packet, &mut out);
    });

    let encoded = encode(&codec, &packet);
    bench("decode SUBSCRIBE (5 topics)", || {
        if let Ok(Some((frame, _))) = Frame::parse(&encoded) {
            let _ = codec.decode(&frame);
        }
    });
}

fn main() {
    println!("mqtt3 Protocol Benchmark");
    println!("========================");
    println!("Iterations per benchmark: {}", ITERATIONS);

    bench_variable_int();
    bench_publish_packet();
    bench_split_frame();
    bench_connect_packet();
    bench_subscribe_packet();

    println!("\nBenchmark complete!");
}
