use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fle_runtime::lua_text::{decode, decode_reply};

fn entity_dump(count: usize) -> String {
    let records: Vec<String> = (0..count)
        .map(|index| {
            format!(
                "{{[\"name\"] = \"pipe\", [\"position\"] = {{[\"x\"] = {}.5, [\"y\"] = 0.5}}, [\"direction\"] = 0, [\"connection_points\"] = {{{{[\"x\"] = {}.5, [\"y\"] = 0.5}}}}}}",
                index,
                index + 1
            )
        })
        .collect();
    format!("{{[\"ok\"] = true, [\"result\"] = {{{}}}}}", records.join(", "))
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for count in [16usize, 256, 4096] {
        let text = entity_dump(count);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::new("entities", count), &text, |b, text| {
            b.iter(|| decode(text))
        });
        group.bench_with_input(BenchmarkId::new("reply", count), &text, |b, text| {
            b.iter(|| decode_reply(text))
        });
    }

    group.finish();
}

criterion_group!(decode_benches, bench_decode);
criterion_main!(decode_benches);
