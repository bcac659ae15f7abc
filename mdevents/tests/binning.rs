mod common;

use common::*;
use mdevents::{binning::masked, prelude::*};

fn unit_cell_workspace<S: Scheduler>(scheduler: &S) -> EventWorkspace<3> {
    let config = BoxControllerConfig::default()
        .with_split_into(2)
        .with_split_threshold(20);
    let mut ws = workspace(10.0, config);
    fill(&mut ws, &unit_cells(10), scheduler);
    ws
}

fn central(bins: [usize; 3]) -> Vec<BinDimension> {
    (0..3)
        .map(|i| BinDimension::index(i, 2.0, 8.0, bins[i]))
        .collect()
}

fn unit_cells_scenario<S: Scheduler>(scheduler: &S) {
    let ws = unit_cell_workspace(scheduler);
    assert_eq!(ws.n_points(), 1_000);

    for strategy in [BinningStrategy::IterateEvents, BinningStrategy::Centerpoint] {
        for (bins, expected) in [([6, 6, 6], 1.0), ([3, 6, 6], 2.0), ([3, 3, 6], 4.0)] {
            let dimensions = central(bins);
            let request = BinningRequest::new(&dimensions).with_strategy(strategy);
            let histo = ws.bin_to_histo(&request, scheduler, &Progress::silent()).unwrap();

            assert_eq!(histo.len(), bins.iter().product::<usize>());
            assert!(
                histo.signal().iter().all(|&s| s == expected),
                "{strategy:?} {bins:?}: {:?}",
                histo.signal()
            );
            assert_eq!(histo.total_signal(), 216.0);
        }
    }
}

fn strategies_agree<S: Scheduler>(scheduler: &S) {
    let config = BoxControllerConfig::default()
        .with_split_into(3)
        .with_split_threshold(40)
        .with_batching(1_000, 2);
    let mut ws = workspace(30.0, config);
    fill(&mut ws, &uniform(8_000, 30.0, 5), scheduler);

    let requests = [
        vec![
            BinDimension::index(0, 3.0, 27.0, 7),
            BinDimension::named("z", 0.0, 30.0, 5),
        ],
        vec![
            BinDimension::named("y", -5.0, 35.0, 40),
            BinDimension::index(0, 0.0, 30.0, 3),
            BinDimension::index(2, 10.0, 11.0, 1),
        ],
        vec![BinDimension::index(1, 0.0, 30.0, 1)],
    ];

    for dimensions in &requests {
        let iterate = BinningRequest::new(dimensions);
        let centerpoint =
            BinningRequest::new(dimensions).with_strategy(BinningStrategy::Centerpoint);

        let a = ws.bin_to_histo(&iterate, scheduler, &Progress::silent()).unwrap();
        let b = ws.bin_to_histo(&centerpoint, scheduler, &Progress::silent()).unwrap();
        assert_same_histo(&a, &b);
    }

    let whole = ws
        .bin_to_histo(&BinningRequest::new(&requests[2]), scheduler, &Progress::silent())
        .unwrap();
    assert_eq!(whole.n_events(), &[8_000]);
    assert_close(whole.signal()[0], ws.signal());
}

fn rejecting_filter_masks_everything<S: Scheduler>(scheduler: &S) {
    struct Nowhere;

    impl ImplicitFunction<3> for Nowhere {
        fn contains(&self, _: &[f32; 3]) -> bool {
            false
        }
    }

    let ws = unit_cell_workspace(scheduler);
    let dimensions = central([6, 6, 6]);

    for strategy in [BinningStrategy::IterateEvents, BinningStrategy::Centerpoint] {
        let request = BinningRequest::new(&dimensions)
            .with_strategy(strategy)
            .with_filter(&Nowhere);
        let histo = ws.bin_to_histo(&request, scheduler, &Progress::silent()).unwrap();

        for i in 0..histo.len() {
            assert!(histo.is_masked(i));
            assert_eq!(histo.signal()[i].to_bits(), masked().to_bits());
            assert_eq!(histo.error_squared()[i].to_bits(), masked().to_bits());
        }
        assert_eq!(histo.total_signal(), 0.0);
    }
}

fn half_space_masks_by_bin_center<S: Scheduler>(scheduler: &S) {
    let ws = unit_cell_workspace(scheduler);
    let mut above = PlaneFunction::<3>::new();
    above.add_plane(&[1.0, 0.0, 0.0], &[5.0, 0.0, 0.0]).unwrap();

    let dimensions = [BinDimension::index(0, 0.0, 10.0, 10)];
    let request = BinningRequest::new(&dimensions).with_filter(&above);
    let histo = ws.bin_to_histo(&request, scheduler, &Progress::silent()).unwrap();

    for i in 0..10 {
        assert_eq!(histo.is_masked(i), i < 5, "bin {i}");
    }
    assert_eq!(histo.signal()[7], 100.0);
}

macro_rules! tests_schedulers {
    ($($name: ident => $test: ident),* $(,)?) => {
        mod sequential_scheduler {
            use super::*;
            $(
                #[test]
                fn $name() {
                    $test(&mdevents::sequential::Inline::default());
                }
            )*
        }

        #[cfg(feature = "parallel")]
        mod parallel_scheduler {
            use super::*;
            $(
                #[test]
                fn $name() {
                    $test(&mdevents::parallel::ThreadPool::global());
                    $test(&mdevents::parallel::ThreadPool::with_threads(2).unwrap());
                }
            )*
        }
    };
}

tests_schedulers! {
    unit_cells => unit_cells_scenario,
    cross_check => strategies_agree,
    always_reject => rejecting_filter_masks_everything,
    plane_mask => half_space_masks_by_bin_center,
}

#[cfg(feature = "parallel")]
#[test]
fn schedulers_agree() {
    let config = BoxControllerConfig::default()
        .with_split_into(2)
        .with_split_threshold(25)
        .with_batching(300, 3)
        .with_task_min_points(100);
    let events = uniform(6_000, 16.0, 21);
    let dimensions = [
        BinDimension::index(0, 0.0, 16.0, 9),
        BinDimension::index(1, 4.0, 12.0, 4),
    ];

    let inline = sequential::Inline::default();
    let pool = parallel::ThreadPool::with_threads(4).unwrap();

    let mut a = workspace(16.0, config.clone());
    let mut b = workspace(16.0, config);
    fill(&mut a, &events, &inline);
    fill(&mut b, &events, &pool);

    assert_eq!(a.n_points(), b.n_points());
    assert_eq!(a.stats().leaf_boxes(), b.stats().leaf_boxes());

    let request = BinningRequest::new(&dimensions);
    let ha = a.bin_to_histo(&request, &inline, &Progress::silent()).unwrap();
    let hb = b.bin_to_histo(&request, &pool, &Progress::silent()).unwrap();
    assert_same_histo(&ha, &hb);
}

#[test]
fn bad_requests_are_rejected() {
    let ws = unit_cell_workspace(&sequential::Inline::default());
    let scheduler = sequential::Inline::default();
    let bin = |dimensions: &[BinDimension]| {
        ws.bin_to_histo(&BinningRequest::new(dimensions), &scheduler, &Progress::silent())
    };

    assert!(bin(&[]).is_err());
    assert!(bin(&[BinDimension::index(3, 0.0, 1.0, 1)]).unwrap_err().is_not_found());
    assert!(bin(&[BinDimension::named("q", 0.0, 1.0, 1)]).unwrap_err().is_not_found());
    assert!(bin(&[BinDimension::index(0, 0.0, 1.0, 0)]).is_err());
    assert!(bin(&[BinDimension::index(0, 1.0, 1.0, 2)]).is_err());
    assert!(bin(&[
        BinDimension::index(0, 0.0, 1.0, 2),
        BinDimension::named("x", 0.0, 1.0, 2),
    ])
    .is_err());
}

#[test]
fn progress_reaches_total() {
    let ws = unit_cell_workspace(&sequential::Inline::default());
    let (progress, updates) = Progress::channel("binning", 0);
    let dimensions = central([6, 6, 6]);

    ws.bin_to_histo(&BinningRequest::new(&dimensions), &sequential::Inline::default(), &progress)
        .unwrap();

    assert_eq!(progress.total(), 216);
    assert_eq!(progress.done(), 216);
    let last = updates.try_iter().last().unwrap();
    assert_eq!(last.done, 216);
}
