use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_ccnd_core::store::ContentStore;
use rust_ccnd_common::content::{
    parse_content_object, with_digest_component, ContentObjectBuilder,
};
use rust_ccnd_common::name::Name;

fn stored(uri: &str) -> (bytes::Bytes, rust_ccnd_common::content::ParsedContentObject) {
    let wire = ContentObjectBuilder::new(Name::from_uri(uri).unwrap(), &b"payload"[..])
        .timestamp_secs(1_300_000_000)
        .build();
    let pco = parse_content_object(&wire).unwrap();
    let full = with_digest_component(&wire, &pco);
    let pco = parse_content_object(&full).unwrap();
    (full, pco)
}

fn bench_store(c: &mut Criterion) {
    c.bench_function("store_insert_1k", |b| {
        let objects: Vec<_> = (0..1000)
            .map(|i| stored(&format!("/bench/{}/{}", i % 37, i)))
            .collect();
        b.iter(|| {
            let mut cs = ContentStore::new(usize::MAX);
            let mut rng = StdRng::seed_from_u64(7);
            for (data, pco) in &objects {
                cs.insert(data.clone(), pco.clone(), &mut rng);
            }
            black_box(cs.count())
        });
    });

    c.bench_function("store_seek_in_10k", |b| {
        let mut cs = ContentStore::new(usize::MAX);
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..10_000 {
            let (data, pco) = stored(&format!("/bench/{}/{}", i % 97, i));
            cs.insert(data, pco, &mut rng);
        }
        let key: Vec<&[u8]> = vec![b"bench", b"42"];
        b.iter(|| black_box(cs.first_at_or_after(&key)));
    });
}

criterion_group!(benches, bench_store);
criterion_main!(benches);
