//! Manifest rewriting and framed payload decoding at varying playlist sizes.
//!
//! Run with: `cargo bench --bench manifest_rewrite`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use embedgate::codec::{self, TransformSpec};
use embedgate::hls::rewrite::rewrite_manifest;
use url::Url;

const PROXY: &str = "https://gate.example/proxy";

/// A live media playlist with a key rotation every 10 segments.
fn generate_playlist(segments: usize) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n");
    out.push_str("#EXT-X-MEDIA-SEQUENCE:1000\n");
    for i in 0..segments {
        if i % 10 == 0 {
            out.push_str(&format!(
                "#EXT-X-KEY:METHOD=AES-128,URI=\"https://key.example/k/7f3c/{}?u_id=Y\"\n",
                i / 10
            ));
        }
        out.push_str("#EXTINF:6.000,\n");
        out.push_str(&format!("seg{}.ts?ssid=Y&exp=1700000030\n", 1000 + i));
    }
    out
}

fn bench_rewrite(c: &mut Criterion) {
    let base = Url::parse("https://cdn.example/hls/SIG123abc/1700000030/index.m3u8?u_id=Y")
        .expect("valid base url");
    let mut group = c.benchmark_group("rewrite_manifest");

    for segments in [10, 100, 1000] {
        let playlist = generate_playlist(segments);
        group.throughput(Throughput::Bytes(playlist.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(segments),
            &playlist,
            |b, playlist| b.iter(|| rewrite_manifest(black_box(playlist), &base, PROXY)),
        );
    }
    group.finish();
}

fn bench_framed_decode(c: &mut Criterion) {
    let key = b"K3y-material-for-framed-fetch-32";
    let url = "https://cdn.example/live/alpha/SIG123abc/1700000030/index.m3u8?u_id=Y";
    let ciphertext: Vec<u8> = url
        .bytes()
        .zip(key.iter().cycle())
        .map(|(b, k)| b ^ k)
        .collect();
    let mut envelope = vec![codec::TAG_SOURCE];
    codec::write_varint(&mut envelope, ciphertext.len() as u64);
    envelope.extend_from_slice(&ciphertext);

    let transform = TransformSpec::default().build().expect("default transform");

    c.bench_function("framed_decode", |b| {
        b.iter(|| {
            let payload = codec::decode_response(black_box(&envelope)).expect("envelope");
            codec::decode_payload(payload, key, transform.as_ref())
        })
    });
}

criterion_group!(benches, bench_rewrite, bench_framed_decode);
criterion_main!(benches);
