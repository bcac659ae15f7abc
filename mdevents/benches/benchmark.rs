use criterion::{AxisScale, BenchmarkGroup, BenchmarkId, Criterion, PlotConfiguration};

use mdevents::prelude::*;
use rand::prelude::*;

const EXTENT: f32 = 100.0;

fn random_events(rng: &mut StdRng, n: usize) -> Vec<Event<3>> {
    (0..n)
        .map(|_| {
            let center = [0.0; 3].map(|_: f32| rng.gen_range(0.0..EXTENT));
            Event::new(rng.gen_range(0.5..2.0), 1.0, center)
        })
        .collect()
}

fn workspace() -> EventWorkspace<3> {
    let dimensions = ["x", "y", "z"]
        .map(|name| Dimension::new(name, "mm", 0.0, EXTENT))
        .to_vec();
    let config = BoxControllerConfig::default()
        .with_split_into(4)
        .with_split_threshold(500)
        .with_batching(10_000, 8)
        .with_task_min_points(20_000);

    EventWorkspace::new(dimensions, config).unwrap()
}

fn filled<S: Scheduler>(events: &[Event<3>], scheduler: &S) -> EventWorkspace<3> {
    let mut ws = workspace();
    ws.add_many_events(events, scheduler, &Progress::silent())
        .unwrap();
    ws.refresh_cache(scheduler).unwrap();
    ws
}

fn bench_scheduler<S: Scheduler>(
    name: &str,
    events: &[Event<3>],
    scheduler: &S,
    group: &mut BenchmarkGroup<'_, criterion::measurement::WallTime>,
) {
    let len = events.len();

    group.bench_function(BenchmarkId::new(format!("add_many_events/{name}"), len), |b| {
        b.iter(|| filled(events, scheduler))
    });

    let ws = filled(events, scheduler);
    let dimensions = [
        BinDimension::index(0, 0.0, EXTENT, 50),
        BinDimension::index(1, 0.0, EXTENT, 50),
    ];

    for strategy in [BinningStrategy::IterateEvents, BinningStrategy::Centerpoint] {
        let request = BinningRequest::new(&dimensions).with_strategy(strategy);
        let id = BenchmarkId::new(format!("{strategy:?}/{name}"), len);
        group.bench_function(id, |b| {
            b.iter(|| ws.bin_to_histo(&request, scheduler, &Progress::silent()).unwrap())
        });
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("mdevents");
    group
        .plot_config(PlotConfiguration::default().summary_scale(AxisScale::Logarithmic))
        .warm_up_time(std::time::Duration::from_secs(1))
        .measurement_time(std::time::Duration::from_secs(2))
        .sample_size(10);

    let mut rng = StdRng::seed_from_u64(1808);

    for n in (12..19).step_by(2).map(|i| 1usize << i) {
        let events = random_events(&mut rng, n);

        bench_scheduler("inline", &events, &sequential::Inline::default(), &mut group);
        #[cfg(feature = "parallel")]
        bench_scheduler("rayon", &events, &parallel::ThreadPool::global(), &mut group);
    }

    group.finish();
}

criterion::criterion_group!(benches, criterion_benchmark);
criterion::criterion_main!(benches);
