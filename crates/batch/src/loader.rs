use canopy_cell::{LoadContext, VegetationCell};
use canopy_common::CellIndex;

use crate::scheduler::{ForkJoinReport, Job, WorkScheduler, run_guarded};

/// Result of one load phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Selected cells that needed loading.
    pub requested: usize,
    /// Of those, cells that finished loading.
    pub loaded: usize,
    pub jobs: usize,
    pub failed: usize,
    pub parallel: bool,
}

/// Load every cell in `selected` that needs it.
///
/// `cells` is indexed by [`CellIndex`]. `selected` may come in any order and
/// may repeat indices. With at least two cells to load, `allow_parallel` and
/// more than one thread, the cells are split into contiguous chunks of
/// `ceil(n / threads)` and each chunk becomes one job; otherwise the cells
/// load on the calling thread without touching the scheduler.
pub fn load_cells(
    cells: &mut [VegetationCell],
    selected: &[CellIndex],
    ctx: &LoadContext<'_>,
    scheduler: &dyn WorkScheduler,
    threads: usize,
    allow_parallel: bool,
) -> LoadOutcome {
    let sorted;
    let selected = if selected.is_sorted() {
        selected
    } else {
        let mut owned = selected.to_vec();
        owned.sort_unstable();
        owned.dedup();
        sorted = owned;
        sorted.as_slice()
    };
    let mut targets: Vec<&mut VegetationCell> = cells
        .iter_mut()
        .filter(|c| c.needs_load_vegetation() && selected.binary_search(&c.index()).is_ok())
        .collect();

    let requested = targets.len();
    if requested == 0 {
        return LoadOutcome::default();
    }

    let _span = tracing::info_span!("load_cells", cells = requested).entered();
    let threads = threads.max(1);
    let parallel = allow_parallel && threads > 1 && requested >= 2;

    let report = if parallel {
        let chunk = requested.div_ceil(threads);
        let ctx = *ctx;
        let jobs: Vec<Job<'_>> = targets
            .chunks_mut(chunk)
            .map(|part| {
                Box::new(move || {
                    for cell in part.iter_mut() {
                        cell.load_vegetation(&ctx);
                    }
                }) as Job<'_>
            })
            .collect();
        tracing::debug!(cells = requested, jobs = jobs.len(), chunk, "loading cells in parallel");
        scheduler.fork_join(jobs)
    } else {
        tracing::debug!(cells = requested, "loading cells sequentially");
        let mut report = ForkJoinReport::default();
        for cell in targets.iter_mut() {
            report.dispatched += 1;
            if !run_guarded(Box::new(|| cell.load_vegetation(ctx))) {
                report.failed += 1;
            }
        }
        report
    };

    let loaded = targets.iter().filter(|c| c.is_loaded()).count();
    if loaded < requested {
        tracing::warn!(requested, loaded, "some cells failed to load");
    }

    LoadOutcome {
        requested,
        loaded,
        jobs: report.dispatched,
        failed: report.failed,
        parallel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{InlineScheduler, RayonScheduler};
    use crate::testing::{CountingScheduler, cells_for, package};
    use canopy_cell::ProceduralPlacement;
    use canopy_pool::VegetationCachePool;

    fn ctx<'a>(
        package: &'a canopy_common::VegetationPackage,
        placement: &'a ProceduralPlacement,
        pool: &'a VegetationCachePool,
    ) -> LoadContext<'a> {
        LoadContext {
            package,
            placement,
            storage: None,
            pool,
        }
    }

    fn indices(range: std::ops::Range<u32>) -> Vec<CellIndex> {
        range.map(CellIndex).collect()
    }

    #[test]
    fn single_cell_never_reaches_the_scheduler() {
        let package = package();
        let pool = VegetationCachePool::new();
        let placement = ProceduralPlacement::default();
        let mut cells = cells_for(&package, 4, 4);
        let scheduler = CountingScheduler::default();

        let outcome = load_cells(
            &mut cells,
            &indices(5..6),
            &ctx(&package, &placement, &pool),
            &scheduler,
            8,
            true,
        );

        assert_eq!(outcome.loaded, 1);
        assert!(!outcome.parallel);
        assert_eq!(scheduler.calls(), 0);
        assert!(cells[5].is_loaded());
        assert!(!cells[4].is_loaded());
    }

    #[test]
    fn cells_are_chunked_per_thread() {
        let package = package();
        let pool = VegetationCachePool::new();
        let placement = ProceduralPlacement::default();
        let mut cells = cells_for(&package, 4, 4);
        let scheduler = CountingScheduler::default();

        let outcome = load_cells(
            &mut cells,
            &indices(0..10),
            &ctx(&package, &placement, &pool),
            &scheduler,
            4,
            true,
        );

        // ceil(10 / 4) = 3 cells per job.
        assert_eq!(outcome.jobs, 4);
        assert_eq!(scheduler.calls(), 1);
        assert_eq!(scheduler.jobs(), 4);
        assert_eq!(outcome.loaded, 10);
        assert!(cells[..10].iter().all(VegetationCell::is_loaded));
        assert!(cells[10..].iter().all(|c| !c.is_loaded()));
    }

    #[test]
    fn unordered_selection_loads_every_listed_cell() {
        let package = package();
        let pool = VegetationCachePool::new();
        let placement = ProceduralPlacement::default();
        let mut cells = cells_for(&package, 4, 4);
        let selected: Vec<_> = [9, 2, 14, 2, 0, 7].into_iter().map(CellIndex).collect();

        let outcome = load_cells(
            &mut cells,
            &selected,
            &ctx(&package, &placement, &pool),
            &InlineScheduler,
            2,
            true,
        );

        assert_eq!(outcome.requested, 5);
        assert_eq!(outcome.loaded, 5);
        for cell in &cells {
            let listed = [0, 2, 7, 9, 14].contains(&cell.index().0);
            assert_eq!(cell.is_loaded(), listed, "cell {}", cell.index().0);
        }
    }

    #[test]
    fn loaded_cells_are_not_reloaded() {
        let package = package();
        let pool = VegetationCachePool::new();
        let placement = ProceduralPlacement::default();
        let mut cells = cells_for(&package, 3, 3);
        let all = indices(0..9);

        let first = load_cells(
            &mut cells,
            &all,
            &ctx(&package, &placement, &pool),
            &InlineScheduler,
            2,
            true,
        );
        assert_eq!(first.loaded, 9);

        let second = load_cells(
            &mut cells,
            &all,
            &ctx(&package, &placement, &pool),
            &InlineScheduler,
            2,
            true,
        );
        assert_eq!(second, LoadOutcome::default());
        assert!(cells.iter().all(|c| c.load_count() == 1));
    }

    #[test]
    fn disabled_multithreading_loads_sequentially() {
        let package = package();
        let pool = VegetationCachePool::new();
        let placement = ProceduralPlacement::default();
        let mut cells = cells_for(&package, 3, 3);
        let scheduler = CountingScheduler::default();

        let outcome = load_cells(
            &mut cells,
            &indices(0..9),
            &ctx(&package, &placement, &pool),
            &scheduler,
            8,
            false,
        );
        assert!(!outcome.parallel);
        assert_eq!(outcome.jobs, 9);
        assert_eq!(scheduler.calls(), 0);

        let mut more = cells_for(&package, 3, 3);
        let outcome = load_cells(
            &mut more,
            &indices(0..9),
            &ctx(&package, &placement, &pool),
            &scheduler,
            1,
            true,
        );
        assert!(!outcome.parallel);
        assert_eq!(scheduler.calls(), 0);
        assert_eq!(outcome.loaded, 9);
    }

    #[test]
    fn parallel_load_matches_sequential() {
        let package = package();
        let pool = VegetationCachePool::new();
        let placement = ProceduralPlacement::default();
        let all = indices(0..100);

        let mut parallel = cells_for(&package, 10, 10);
        let rayon = RayonScheduler::new(8).unwrap();
        let outcome = load_cells(
            &mut parallel,
            &all,
            &ctx(&package, &placement, &pool),
            &rayon,
            8,
            true,
        );
        assert!(outcome.parallel);
        assert_eq!(outcome.loaded, 100);

        let mut sequential = cells_for(&package, 10, 10);
        load_cells(
            &mut sequential,
            &all,
            &ctx(&package, &placement, &pool),
            &InlineScheduler,
            1,
            false,
        );

        for (a, b) in parallel.iter().zip(&sequential) {
            for model in 0..package.models.len() {
                assert_eq!(
                    a.current_vegetation_list(model).unwrap(),
                    b.current_vegetation_list(model).unwrap()
                );
            }
        }
    }
}
