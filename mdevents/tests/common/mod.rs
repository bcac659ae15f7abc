#![allow(dead_code)]

use mdevents::prelude::*;
use rand::prelude::*;

/// Workspace over `[0, extent)^3`.
pub fn workspace(extent: f32, config: BoxControllerConfig) -> EventWorkspace<3> {
    let dimensions = ["x", "y", "z"]
        .map(|name| Dimension::new(name, "A", 0.0, extent))
        .to_vec();
    EventWorkspace::new(dimensions, config).unwrap()
}

/// One event of weight 1 at the centre of every unit cell of `[0, n)^3`.
pub fn unit_cells(n: usize) -> Vec<Event<3>> {
    (0..n * n * n)
        .map(|i| {
            let cell = [i % n, (i / n) % n, i / (n * n)];
            Event::unit(cell.map(|c| c as f32 + 0.5))
        })
        .collect()
}

/// Uniformly distributed events in `[0, extent)^3` with random weights.
pub fn uniform(n: usize, extent: f32, seed: u64) -> Vec<Event<3>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let center = [0.0f32; 3].map(|_| rng.gen_range(0.0..extent));
            let signal = rng.gen_range(0.5f32..2.0);
            Event::new(signal, signal * 0.5, center)
        })
        .collect()
}

/// Adds the events with the scheduler and refreshes the caches.
pub fn fill<S: Scheduler>(workspace: &mut EventWorkspace<3>, events: &[Event<3>], scheduler: &S) {
    let added = workspace
        .add_many_events(events, scheduler, &Progress::silent())
        .unwrap();
    assert_eq!(added, events.len());
    workspace.refresh_cache(scheduler).unwrap();
}

pub fn assert_close(a: f64, b: f64) {
    assert!((a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0), "{a} != {b}");
}

/// Asserts two histograms hold the same totals, bin per bin.
pub fn assert_same_histo(a: &HistoWorkspace, b: &HistoWorkspace) {
    assert_eq!(a.len(), b.len());
    assert_eq!(a.n_events(), b.n_events());
    for i in 0..a.len() {
        assert_close(a.signal()[i], b.signal()[i]);
        assert_close(a.error_squared()[i], b.error_squared()[i]);
    }
}
