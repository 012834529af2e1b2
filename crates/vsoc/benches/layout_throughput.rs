use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use vsoc::regions::default_region_specs;
use vsoc::socket_forward::MAX_PAYLOAD_SIZE;
use vsoc::{Packet, RegionSpec, SegmentDescriptor, SegmentLayout};

fn benchmark_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("layout_plan");

    for count in [8usize, 64, 512] {
        let specs: Vec<RegionSpec> = (0..count)
            .map(|i| RegionSpec::new(format!("region_{}", i), 4096 * (i % 7 + 1), 2, 2))
            .collect();

        group.bench_with_input(BenchmarkId::new("plan", count), &specs, |b, specs| {
            b.iter(|| SegmentLayout::plan_with_page_size(black_box(specs.clone()), 4096).unwrap());
        });
    }

    group.bench_function("resize_first_of_default", |b| {
        let layout = SegmentLayout::plan_with_page_size(default_region_specs(), 4096).unwrap();
        b.iter(|| {
            let mut layout = layout.clone();
            black_box(layout.resize("input_events", black_box(1 << 20)));
        });
    });

    group.finish();
}

fn benchmark_descriptor(c: &mut Criterion) {
    let layout = SegmentLayout::plan_with_page_size(default_region_specs(), 4096).unwrap();
    let mut buffer = vec![0u8; layout.descriptor_table_size()];

    c.bench_function("write_layout", |b| {
        b.iter(|| layout.write_layout(black_box(&mut buffer)).unwrap());
    });

    layout.write_layout(&mut buffer).unwrap();
    c.bench_function("read_descriptor", |b| {
        b.iter(|| SegmentDescriptor::read_from(black_box(&buffer)).unwrap());
    });
}

fn benchmark_packet_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_fill");

    for size in [64usize, 1024, MAX_PAYLOAD_SIZE] {
        let data = vec![7u8; size];
        let mut packet = Packet::make_data();

        group.bench_with_input(BenchmarkId::new("set_payload", size), &data, |b, data| {
            b.iter(|| {
                packet.set_payload(black_box(data));
                black_box(packet.raw_data().len());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_plan, benchmark_descriptor, benchmark_packet_fill);
criterion_main!(benches);
