use super::{HistoWorkspace, Plan};
use crate::{
    error::{Error, Result},
    event::Totals,
    implicit::BoxFunction,
    progress::Progress,
    storage::DiskBuffer,
    tree::Node,
    Scheduler, Task,
};

/// Number of chunks handed to each worker.
const CHUNKS_PER_WORKER: usize = 2;

/// Bins the events of the leaves overlapping each chunk of the histogram.
///
/// Chunks are slabs along the slowest varying output axis, so each task owns a contiguous range
/// of the histogram arrays.
pub(super) fn bin_all<const D: usize, S>(
    root: &Node<D>,
    disk: Option<&DiskBuffer<D>>,
    plan: &Plan<D>,
    histo: &mut HistoWorkspace,
    scheduler: &S,
    progress: &Progress,
) -> Result<()>
where
    S: Scheduler + ?Sized,
{
    let (slowest, stride) = plan.slowest();
    let chunks = (scheduler.parallelism() * CHUNKS_PER_WORKER).clamp(1, slowest);
    let per_chunk = slowest.div_ceil(chunks);

    let tasks = histo
        .chunks_mut(per_chunk * stride)
        .map(move |mut chunk| {
            let range = chunk.range();
            let slab = range.start / stride..range.end.div_ceil(stride);

            Task::new(range.len() as u64, move || {
                if progress.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let region = BoxFunction::new(plan.slab(slab));
                let mut leaves = Vec::new();
                root.collect(&mut leaves, usize::MAX, true, Some(&region));

                for leaf in leaves.iter().filter_map(|node| node.as_leaf()) {
                    if let Some(linear) = plan.box_bin(leaf.extents()) {
                        chunk.add(linear, &leaf.totals());
                        continue;
                    }

                    leaf.with_events(disk, |events| {
                        for event in events {
                            if let Some(linear) = plan.bin_of(&event.center) {
                                let mut totals = Totals::default();
                                totals.push(event);
                                chunk.add(linear, &totals);
                            }
                        }
                    })?;
                }
                progress.report_n(range.len() as u64, None);

                Ok(())
            })
        })
        .collect();

    scheduler.execute(tasks)
}
