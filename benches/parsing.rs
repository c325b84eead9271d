use criterion::{criterion_group, criterion_main, Criterion};
use std::path::Path;

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    std::fs::read_to_string(path).unwrap()
}

fn bench_parse_mime(c: &mut Criterion) {
    let simple = fixture("simple.eml");
    let multipart = fixture("multipart.eml");

    c.bench_function("parse_simple_eml", |b| {
        b.iter(|| relaymail::parser::mime::parse_mime_email(&simple, "bench").unwrap())
    });

    c.bench_function("parse_and_normalize_multipart", |b| {
        b.iter(|| {
            let email = relaymail::parser::mime::parse_mime_email(&multipart, "bench").unwrap();
            relaymail::parser::mime::format_attachments(
                relaymail::parser::mime::format_inline_images(email),
            )
        })
    });
}

fn bench_encode_batch(c: &mut Criterion) {
    let email = relaymail::parser::mime::parse_mime_email(&fixture("simple.eml"), "bench").unwrap();
    let emails = vec![email; 100];

    c.bench_function("encode_batch_100", |b| {
        b.iter(|| relaymail::sync::transport::encode_batch(&emails, &[]).unwrap())
    });
}

criterion_group!(benches, bench_parse_mime, bench_encode_batch);
criterion_main!(benches);
