use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use portwire_core::{Bottle, Value};

fn sample() -> Bottle {
    let nested = (0..16).map(Value::Int32).collect::<Bottle>();
    Bottle::new()
        .with("telemetry")
        .with(42)
        .with(3.25)
        .with(nested)
        .with(Value::Blob(bytes::Bytes::from(vec![7u8; 256])))
}

/// 对比二进制与文本两种语法的编解码开销。
///
/// 嵌套列表走 speciality 路径，能反映逐项标签被省略后的收益。
fn bench_bottle(c: &mut Criterion) {
    let bottle = sample();
    let binary = bottle.to_binary();
    let text = bottle.to_text();

    c.bench_function("bottle_encode_binary", |b| b.iter(|| black_box(&bottle).to_binary()));
    c.bench_function("bottle_decode_binary", |b| {
        b.iter(|| Bottle::from_binary(black_box(binary.clone())))
    });
    c.bench_function("bottle_encode_text", |b| b.iter(|| black_box(&bottle).to_text()));
    c.bench_function("bottle_decode_text", |b| b.iter(|| Bottle::from_text(black_box(&text))));
}

criterion_group!(codec_benches, bench_bottle);
criterion_main!(codec_benches);
