use super::{Bin, HistoWorkspace, Plan};
use crate::{
    error::{Error, Result},
    progress::Progress,
    storage::DiskBuffer,
    tree::Node,
    Scheduler, Task,
};

/// Number of blocks of bins handed to each worker.
const BLOCKS_PER_WORKER: usize = 4;

/// Queries the tree for the totals of every bin, in parallel over blocks of bins.
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
    let blocks = (scheduler.parallelism() * BLOCKS_PER_WORKER).clamp(1, histo.len());
    let block_len = histo.len().div_ceil(blocks);

    let tasks = histo
        .chunks_mut(block_len)
        .map(move |mut chunk| {
            Task::new(block_len as u64, move || {
                if progress.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let range = chunk.range();
                for linear in range.clone() {
                    let mut bin = Bin::new(plan.bin_extents(linear));
                    root.centerpoint_bin(&mut bin, disk)?;
                    chunk.add(linear, &bin.totals);
                }
                progress.report_n(range.len() as u64, None);

                Ok(())
            })
        })
        .collect();

    scheduler.execute(tasks)
}
