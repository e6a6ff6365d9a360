//! Divide-and-conquer parallel algorithms over slices.
//!
//! Every algorithm splits its input into contiguous chunks (twice the worker
//! count), schedules one task per chunk onto a shared completion latch, and
//! waits on that latch while lending a temporary worker to the pool. Inputs
//! smaller than [`SEQUENTIAL_CUTOFF_BYTES`] of element data skip the fan-out
//! and run the sequential algorithm inline.
//!
//! Each algorithm comes in two forms: `xxx_with(&scheduler, ...)` running on
//! an explicit pool, and `xxx(...)` running on the process-wide default.

use std::cmp::Ordering;
use std::mem;
use std::ops::Range;
use std::ptr;

use crate::latch::Latch;
use crate::scheduler::{default_scheduler, schedule_task, TaskScheduler};
use crate::unwind;

/// Inputs below this many bytes of element data are processed sequentially.
const SEQUENTIAL_CUTOFF_BYTES: usize = 64 * 1024;

// -----------------------------------------------------------------------------
// Chunk dispatch

type ChunkTask<'a> = Box<dyn FnOnce() + Send + 'a>;

fn below_cutoff<T>(len: usize) -> bool {
    len * mem::size_of::<T>() < SEQUENTIAL_CUTOFF_BYTES
}

fn max_parts(scheduler: &TaskScheduler) -> usize {
    scheduler.worker_count() * 2
}

fn chunk_size(len: usize, parts: usize) -> usize {
    len.div_ceil(parts.max(1)).max(1)
}

fn chunk_ranges(len: usize, size: usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::with_capacity(len.div_ceil(size));
    let mut start = 0;
    while start < len {
        let end = (start + size).min(len);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Extends a task's borrows to `'static` so it can enter the scheduler's
/// queues.
///
/// # Safety
///
/// The caller must not return control to the owner of the borrowed data
/// until the task has run or been dropped. The drivers here guarantee that
/// by waiting on the chunk latch before returning.
unsafe fn erase<'a>(task: ChunkTask<'a>) -> Box<dyn FnOnce() + Send + 'static> {
    unsafe { mem::transmute(task) }
}

/// Schedules one task per chunk onto a shared completion latch and blocks
/// until all of them have finished, lending a temporary worker to the pool
/// while blocked. Panics (only after the wait) if the scheduler refused any
/// chunk, which happens when it is stopped mid-algorithm.
fn run_chunks(scheduler: &TaskScheduler, tasks: Vec<ChunkTask<'_>>) {
    let latch = Latch::new(tasks.len() as u32);
    let mut all_scheduled = true;
    for task in tasks {
        // SAFETY: the wait below keeps every borrow behind the erased
        // lifetime alive until the task has run or been dropped.
        let task = unsafe { erase(task) };
        all_scheduled &= schedule_task(&latch, task, scheduler);
    }
    scheduler.wait_for(&latch);
    assert!(
        all_scheduled,
        "scheduler refused parallel work; was it stopped?"
    );
}

mod raw {
    //! Thread-erased pointers for tasks that share a buffer.
    //!
    //! The splitting code is responsible for handing each task a disjoint
    //! region, and the drivers wait for every task before the buffer expires.

    pub(super) struct ConstPtr<T>(pub *const T);

    impl<T> Clone for ConstPtr<T> {
        fn clone(&self) -> Self {
            *self
        }
    }
    impl<T> Copy for ConstPtr<T> {}

    // SAFETY: the pointee is only read, from regions the splitting code
    // hands out.
    unsafe impl<T: Sync> Send for ConstPtr<T> {}

    pub(super) struct MutPtr<T>(pub *mut T);

    impl<T> Clone for MutPtr<T> {
        fn clone(&self) -> Self {
            *self
        }
    }
    impl<T> Copy for MutPtr<T> {}

    // SAFETY: writes land in disjoint regions handed out by the splitting
    // code.
    unsafe impl<T: Send> Send for MutPtr<T> {}
}

// -----------------------------------------------------------------------------
// Element-wise algorithms

/// Invokes `f` on every element, in unspecified order, fanning chunks out
/// across the pool.
pub fn for_each_with<T, F>(scheduler: &TaskScheduler, items: &[T], f: F)
where
    T: Sync,
    F: Fn(&T) + Sync,
{
    if below_cutoff::<T>(items.len()) {
        for item in items {
            f(item);
        }
        return;
    }
    let f = &f;
    let size = chunk_size(items.len(), max_parts(scheduler));
    let tasks = items
        .chunks(size)
        .map(|chunk| {
            Box::new(move || {
                for item in chunk {
                    f(item);
                }
            }) as ChunkTask
        })
        .collect();
    run_chunks(scheduler, tasks);
}

/// [`for_each_with`] on the default scheduler.
pub fn for_each<T, F>(items: &[T], f: F)
where
    T: Sync,
    F: Fn(&T) + Sync,
{
    for_each_with(&default_scheduler(), items, f)
}

/// Invokes `f` on every element through a mutable reference, in unspecified
/// order.
pub fn for_each_mut_with<T, F>(scheduler: &TaskScheduler, items: &mut [T], f: F)
where
    T: Send,
    F: Fn(&mut T) + Sync,
{
    if below_cutoff::<T>(items.len()) {
        for item in items {
            f(item);
        }
        return;
    }
    let f = &f;
    let size = chunk_size(items.len(), max_parts(scheduler));
    let tasks = items
        .chunks_mut(size)
        .map(|chunk| {
            Box::new(move || {
                for item in chunk {
                    f(item);
                }
            }) as ChunkTask
        })
        .collect();
    run_chunks(scheduler, tasks);
}

/// [`for_each_mut_with`] on the default scheduler.
pub fn for_each_mut<T, F>(items: &mut [T], f: F)
where
    T: Send,
    F: Fn(&mut T) + Sync,
{
    for_each_mut_with(&default_scheduler(), items, f)
}

/// Overwrites every element with a clone of `value`.
pub fn fill_with<T>(scheduler: &TaskScheduler, items: &mut [T], value: T)
where
    T: Clone + Send + Sync,
{
    for_each_mut_with(scheduler, items, move |slot| *slot = value.clone());
}

/// [`fill_with`] on the default scheduler.
pub fn fill<T>(items: &mut [T], value: T)
where
    T: Clone + Send + Sync,
{
    fill_with(&default_scheduler(), items, value)
}

/// Pointwise-maps `input` into `output`, which must have the same length.
pub fn transform_with<T, U, F>(scheduler: &TaskScheduler, input: &[T], output: &mut [U], f: F)
where
    T: Sync,
    U: Send,
    F: Fn(&T) -> U + Sync,
{
    assert_eq!(
        input.len(),
        output.len(),
        "transform requires equal-length input and output"
    );
    if below_cutoff::<T>(input.len()) {
        for (src, dst) in input.iter().zip(output) {
            *dst = f(src);
        }
        return;
    }
    let f = &f;
    let size = chunk_size(input.len(), max_parts(scheduler));
    let tasks = input
        .chunks(size)
        .zip(output.chunks_mut(size))
        .map(|(src, dst)| {
            Box::new(move || {
                for (src, dst) in src.iter().zip(dst) {
                    *dst = f(src);
                }
            }) as ChunkTask
        })
        .collect();
    run_chunks(scheduler, tasks);
}

/// [`transform_with`] on the default scheduler.
pub fn transform<T, U, F>(input: &[T], output: &mut [U], f: F)
where
    T: Sync,
    U: Send,
    F: Fn(&T) -> U + Sync,
{
    transform_with(&default_scheduler(), input, output, f)
}

/// Pointwise-maps a slice over itself, the aliasing form of
/// [`transform_with`].
pub fn transform_in_place_with<T, F>(scheduler: &TaskScheduler, items: &mut [T], f: F)
where
    T: Send,
    F: Fn(&T) -> T + Sync,
{
    for_each_mut_with(scheduler, items, move |slot| *slot = f(slot));
}

/// [`transform_in_place_with`] on the default scheduler.
pub fn transform_in_place<T, F>(items: &mut [T], f: F)
where
    T: Send,
    F: Fn(&T) -> T + Sync,
{
    transform_in_place_with(&default_scheduler(), items, f)
}

// -----------------------------------------------------------------------------
// Reductions

/// Folds the slice with an associative `op`, starting from `init`. Each chunk
/// is folded sequentially and the chunk results are combined in chunk order,
/// so for associative `op` the result equals the sequential left fold.
pub fn reduce_with<T, Op>(scheduler: &TaskScheduler, items: &[T], init: T, op: Op) -> T
where
    T: Clone + Send + Sync,
    Op: Fn(T, T) -> T + Sync,
{
    if below_cutoff::<T>(items.len()) {
        return items.iter().fold(init, |acc, item| op(acc, item.clone()));
    }
    let size = chunk_size(items.len(), max_parts(scheduler));
    let mut partials: Vec<Option<T>> = (0..items.len().div_ceil(size)).map(|_| None).collect();
    {
        let op = &op;
        let tasks = items
            .chunks(size)
            .zip(partials.iter_mut())
            .map(|(chunk, slot)| {
                Box::new(move || {
                    let mut iter = chunk.iter().cloned();
                    let first = iter.next().expect("chunks are never empty");
                    *slot = Some(iter.fold(first, |acc, item| op(acc, item)));
                }) as ChunkTask
            })
            .collect();
        run_chunks(scheduler, tasks);
    }
    partials.into_iter().fold(init, |acc, partial| {
        op(acc, partial.expect("parallel task did not complete"))
    })
}

/// [`reduce_with`] on the default scheduler.
pub fn reduce<T, Op>(items: &[T], init: T, op: Op) -> T
where
    T: Clone + Send + Sync,
    Op: Fn(T, T) -> T + Sync,
{
    reduce_with(&default_scheduler(), items, init, op)
}

/// Maps every element and folds the mapped values with an associative
/// `reduce`. The initial value passes through `map` as well.
pub fn map_reduce_with<T, U, M, R>(
    scheduler: &TaskScheduler,
    items: &[T],
    init: T,
    map: M,
    reduce: R,
) -> U
where
    T: Sync,
    U: Send,
    M: Fn(&T) -> U + Sync,
    R: Fn(U, U) -> U + Sync,
{
    if below_cutoff::<T>(items.len()) {
        return items
            .iter()
            .fold(map(&init), |acc, item| reduce(acc, map(item)));
    }
    let size = chunk_size(items.len(), max_parts(scheduler));
    let mut partials: Vec<Option<U>> = (0..items.len().div_ceil(size)).map(|_| None).collect();
    {
        let map = &map;
        let reduce = &reduce;
        let tasks = items
            .chunks(size)
            .zip(partials.iter_mut())
            .map(|(chunk, slot)| {
                Box::new(move || {
                    let mut iter = chunk.iter();
                    let first = map(iter.next().expect("chunks are never empty"));
                    *slot = Some(iter.fold(first, |acc, item| reduce(acc, map(item))));
                }) as ChunkTask
            })
            .collect();
        run_chunks(scheduler, tasks);
    }
    partials.into_iter().fold(map(&init), |acc, partial| {
        reduce(acc, partial.expect("parallel task did not complete"))
    })
}

/// [`map_reduce_with`] on the default scheduler.
pub fn map_reduce<T, U, M, R>(items: &[T], init: T, map: M, reduce: R) -> U
where
    T: Sync,
    U: Send,
    M: Fn(&T) -> U + Sync,
    R: Fn(U, U) -> U + Sync,
{
    map_reduce_with(&default_scheduler(), items, init, map, reduce)
}

/// Counts the elements satisfying `pred`.
pub fn count_if_with<T, P>(scheduler: &TaskScheduler, items: &[T], pred: P) -> usize
where
    T: Sync,
    P: Fn(&T) -> bool + Sync,
{
    if below_cutoff::<T>(items.len()) {
        return items.iter().filter(|item| pred(item)).count();
    }
    let size = chunk_size(items.len(), max_parts(scheduler));
    let mut counts = vec![0usize; items.len().div_ceil(size)];
    {
        let pred = &pred;
        let tasks = items
            .chunks(size)
            .zip(counts.iter_mut())
            .map(|(chunk, slot)| {
                Box::new(move || {
                    *slot = chunk.iter().filter(|item| pred(item)).count();
                }) as ChunkTask
            })
            .collect();
        run_chunks(scheduler, tasks);
    }
    counts.into_iter().sum()
}

/// [`count_if_with`] on the default scheduler.
pub fn count_if<T, P>(items: &[T], pred: P) -> usize
where
    T: Sync,
    P: Fn(&T) -> bool + Sync,
{
    count_if_with(&default_scheduler(), items, pred)
}

// -----------------------------------------------------------------------------
// Extrema

/// Returns the smallest element under `cmp`, the leftmost one on ties.
pub fn min_element_with<'a, T, C>(
    scheduler: &TaskScheduler,
    items: &'a [T],
    cmp: C,
) -> Option<&'a T>
where
    T: Sync,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    extremum(scheduler, items, &cmp, Ordering::Less)
}

/// [`min_element_with`] on the default scheduler.
pub fn min_element<T, C>(items: &[T], cmp: C) -> Option<&T>
where
    T: Sync,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    min_element_with(&default_scheduler(), items, cmp)
}

/// Returns the largest element under `cmp`, the leftmost one on ties.
pub fn max_element_with<'a, T, C>(
    scheduler: &TaskScheduler,
    items: &'a [T],
    cmp: C,
) -> Option<&'a T>
where
    T: Sync,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    extremum(scheduler, items, &cmp, Ordering::Greater)
}

/// [`max_element_with`] on the default scheduler.
pub fn max_element<T, C>(items: &[T], cmp: C) -> Option<&T>
where
    T: Sync,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    max_element_with(&default_scheduler(), items, cmp)
}

fn extremum<'a, T, C>(
    scheduler: &TaskScheduler,
    items: &'a [T],
    cmp: &C,
    wins: Ordering,
) -> Option<&'a T>
where
    T: Sync,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    if items.is_empty() {
        return None;
    }
    if below_cutoff::<T>(items.len()) {
        return Some(&items[seq_extremum(items, cmp, wins)]);
    }
    let size = chunk_size(items.len(), max_parts(scheduler));
    let mut bests: Vec<Option<usize>> = (0..items.len().div_ceil(size)).map(|_| None).collect();
    let tasks = items
        .chunks(size)
        .zip(bests.iter_mut())
        .enumerate()
        .map(|(index, (chunk, slot))| {
            Box::new(move || {
                *slot = Some(index * size + seq_extremum(chunk, cmp, wins));
            }) as ChunkTask
        })
        .collect();
    run_chunks(scheduler, tasks);
    let mut best: Option<usize> = None;
    for candidate in bests {
        let candidate = candidate.expect("parallel task did not complete");
        best = Some(match best {
            None => candidate,
            // A later chunk must strictly beat the current best, which keeps
            // the leftmost of equal elements.
            Some(current) => {
                if cmp(&items[candidate], &items[current]) == wins {
                    candidate
                } else {
                    current
                }
            }
        });
    }
    best.map(|index| &items[index])
}

fn seq_extremum<T, C>(items: &[T], cmp: &C, wins: Ordering) -> usize
where
    C: Fn(&T, &T) -> Ordering,
{
    let mut best = 0;
    for index in 1..items.len() {
        if cmp(&items[index], &items[best]) == wins {
            best = index;
        }
    }
    best
}

// -----------------------------------------------------------------------------
// Prefix scan

/// Inclusive prefix scan of `input` into `output` under an associative `op`.
/// The slices must have equal length.
pub fn scan_with<T, Op>(scheduler: &TaskScheduler, input: &[T], output: &mut [T], op: Op)
where
    T: Clone + Send + Sync,
    Op: Fn(&T, &T) -> T + Sync,
{
    assert_eq!(
        input.len(),
        output.len(),
        "scan requires equal-length input and output"
    );
    output.clone_from_slice(input);
    scan_in_place_with(scheduler, output, op);
}

/// [`scan_with`] on the default scheduler.
pub fn scan<T, Op>(input: &[T], output: &mut [T], op: Op)
where
    T: Clone + Send + Sync,
    Op: Fn(&T, &T) -> T + Sync,
{
    scan_with(&default_scheduler(), input, output, op)
}

/// Inclusive prefix scan of a slice over itself.
///
/// Two passes: the first totals every chunk (and finishes chunk zero, which
/// needs no offset), the driver then forms the exclusive prefix of the chunk
/// totals, and the second pass folds each remaining chunk with its offset.
pub fn scan_in_place_with<T, Op>(scheduler: &TaskScheduler, items: &mut [T], op: Op)
where
    T: Clone + Send + Sync,
    Op: Fn(&T, &T) -> T + Sync,
{
    if below_cutoff::<T>(items.len()) {
        seq_scan(items, &op);
        return;
    }
    let size = chunk_size(items.len(), max_parts(scheduler));
    let count = items.len().div_ceil(size);
    let mut totals: Vec<Option<T>> = (0..count).map(|_| None).collect();
    {
        let op = &op;
        let tasks = items
            .chunks_mut(size)
            .zip(totals.iter_mut())
            .enumerate()
            .map(|(index, (chunk, total))| {
                Box::new(move || {
                    if index == 0 {
                        seq_scan(chunk, op);
                        *total = Some(chunk[chunk.len() - 1].clone());
                    } else {
                        let mut iter = chunk.iter();
                        let first = iter.next().expect("chunks are never empty").clone();
                        *total = Some(iter.fold(first, |acc, item| op(&acc, item)));
                    }
                }) as ChunkTask
            })
            .collect();
        run_chunks(scheduler, tasks);
    }
    let mut offsets: Vec<Option<T>> = Vec::with_capacity(count);
    let mut acc: Option<T> = None;
    for total in &totals {
        offsets.push(acc.clone());
        let total = total.as_ref().expect("parallel task did not complete");
        acc = Some(match acc {
            None => total.clone(),
            Some(acc) => op(&acc, total),
        });
    }
    {
        let op = &op;
        let tasks = items
            .chunks_mut(size)
            .zip(offsets)
            .skip(1)
            .map(|(chunk, offset)| {
                let offset = offset.expect("later chunks always have an offset");
                Box::new(move || {
                    let mut acc = offset;
                    for slot in chunk.iter_mut() {
                        acc = op(&acc, &*slot);
                        *slot = acc.clone();
                    }
                }) as ChunkTask
            })
            .collect();
        run_chunks(scheduler, tasks);
    }
}

/// [`scan_in_place_with`] on the default scheduler.
pub fn scan_in_place<T, Op>(items: &mut [T], op: Op)
where
    T: Clone + Send + Sync,
    Op: Fn(&T, &T) -> T + Sync,
{
    scan_in_place_with(&default_scheduler(), items, op)
}

fn seq_scan<T, Op>(items: &mut [T], op: &Op)
where
    T: Clone,
    Op: Fn(&T, &T) -> T,
{
    for index in 1..items.len() {
        let next = op(&items[index - 1], &items[index]);
        items[index] = next;
    }
}

// -----------------------------------------------------------------------------
// Sorting

/// Sorts the slice. Not guaranteed stable.
pub fn sort_with<T>(scheduler: &TaskScheduler, items: &mut [T])
where
    T: Ord + Send + Sync,
{
    parallel_sort(scheduler, items, &T::cmp, false);
}

/// [`sort_with`] on the default scheduler.
pub fn sort<T>(items: &mut [T])
where
    T: Ord + Send + Sync,
{
    sort_with(&default_scheduler(), items)
}

/// Sorts the slice with a comparator. Not guaranteed stable.
pub fn sort_by_with<T, C>(scheduler: &TaskScheduler, items: &mut [T], cmp: C)
where
    T: Send + Sync,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    parallel_sort(scheduler, items, &cmp, false);
}

/// [`sort_by_with`] on the default scheduler.
pub fn sort_by<T, C>(items: &mut [T], cmp: C)
where
    T: Send + Sync,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    sort_by_with(&default_scheduler(), items, cmp)
}

/// Sorts the slice, preserving the relative order of equal elements.
pub fn stable_sort_with<T>(scheduler: &TaskScheduler, items: &mut [T])
where
    T: Ord + Send + Sync,
{
    parallel_sort(scheduler, items, &T::cmp, true);
}

/// [`stable_sort_with`] on the default scheduler.
pub fn stable_sort<T>(items: &mut [T])
where
    T: Ord + Send + Sync,
{
    stable_sort_with(&default_scheduler(), items)
}

/// Sorts the slice with a comparator, preserving the relative order of equal
/// elements.
pub fn stable_sort_by_with<T, C>(scheduler: &TaskScheduler, items: &mut [T], cmp: C)
where
    T: Send + Sync,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    parallel_sort(scheduler, items, &cmp, true);
}

/// [`stable_sort_by_with`] on the default scheduler.
pub fn stable_sort_by<T, C>(items: &mut [T], cmp: C)
where
    T: Send + Sync,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    stable_sort_by_with(&default_scheduler(), items, cmp)
}

fn merge_cutoff<T>() -> usize {
    (SEQUENTIAL_CUTOFF_BYTES / mem::size_of::<T>().max(1)).max(1)
}

/// Chunk-sorts the slice in parallel, then pairwise-merges adjacent runs
/// until one remains. The merges are stable, so the whole sort is stable
/// whenever the per-chunk sort is.
fn parallel_sort<T, C>(scheduler: &TaskScheduler, items: &mut [T], cmp: &C, stable: bool)
where
    T: Send + Sync,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    let len = items.len();
    if below_cutoff::<T>(len) {
        if stable {
            items.sort_by(|a, b| cmp(a, b));
        } else {
            items.sort_unstable_by(|a, b| cmp(a, b));
        }
        return;
    }
    let size = chunk_size(len, max_parts(scheduler));

    // Phase one: sort every chunk.
    let tasks = items
        .chunks_mut(size)
        .map(|chunk| {
            Box::new(move || {
                if stable {
                    chunk.sort_by(|a, b| cmp(a, b));
                } else {
                    chunk.sort_unstable_by(|a, b| cmp(a, b));
                }
            }) as ChunkTask
        })
        .collect();
    run_chunks(scheduler, tasks);

    // Phase two: merge rounds. Each pair merges through the scratch buffer
    // and copies the result back; the odd run out carries over to the next
    // round. The scratch buffer's length stays zero: it holds elements only
    // transiently, as raw storage.
    let mut runs = chunk_ranges(len, size);
    let mut scratch: Vec<T> = Vec::with_capacity(len);
    let base = raw::MutPtr(items.as_mut_ptr());
    let scratch_base = raw::MutPtr(scratch.as_mut_ptr());
    while runs.len() > 1 {
        let mut next_runs = Vec::with_capacity(runs.len().div_ceil(2));
        let mut tasks: Vec<ChunkTask> = Vec::with_capacity(runs.len() / 2);
        let mut index = 0;
        while index + 1 < runs.len() {
            let a = runs[index].clone();
            let b = runs[index + 1].clone();
            next_runs.push(a.start..b.end);
            tasks.push(Box::new(move || {
                // SAFETY: this pair owns `a.start..b.end` of both buffers for
                // the round, and the round waits for every pair before the
                // buffers are touched again.
                let base = base;
                let scratch_base = scratch_base;
                unsafe {
                    let merged = b.end - a.start;
                    let out = scratch_base.0.add(a.start);
                    par_merge(scheduler, base.0 as *const T, a.clone(), b, out, cmp);
                    ptr::copy_nonoverlapping(out as *const T, base.0.add(a.start), merged);
                }
            }) as ChunkTask);
            index += 2;
        }
        if index < runs.len() {
            next_runs.push(runs[index].clone());
        }
        run_chunks(scheduler, tasks);
        runs = next_runs;
    }
}

/// Merges the sorted runs `a` and `b` of `src` into `dst`, recursing in
/// parallel above the cutoff: the median of the larger run is located in the
/// other by binary search, one half is scheduled as a task and the other
/// runs inline. Equal elements keep their a-before-b order.
///
/// # Safety
///
/// `src` must be valid for reads over `a` and `b`, `dst` valid for writes of
/// `a.len() + b.len()` elements and disjoint from both source regions, and
/// all three must stay valid for the duration of the call.
unsafe fn par_merge<T, C>(
    scheduler: &TaskScheduler,
    src: *const T,
    a: Range<usize>,
    b: Range<usize>,
    dst: *mut T,
    cmp: &C,
) where
    T: Send + Sync,
    C: Fn(&T, &T) -> Ordering + Sync,
{
    if a.len() + b.len() <= merge_cutoff::<T>() {
        unsafe { seq_merge(src, a, b, dst, cmp) };
        return;
    }
    let (a_split, b_split) = if a.len() >= b.len() {
        let mid = a.start + a.len() / 2;
        let pivot = unsafe { &*src.add(mid) };
        // Elements of `b` equal to the pivot stay right of it.
        let b_at =
            unsafe { partition_point(src, b.clone(), |x| cmp(x, pivot) == Ordering::Less) };
        (mid, b_at)
    } else {
        let mid = b.start + b.len() / 2;
        let pivot = unsafe { &*src.add(mid) };
        // Elements of `a` equal to the pivot go left of it.
        let a_at =
            unsafe { partition_point(src, a.clone(), |x| cmp(x, pivot) != Ordering::Greater) };
        (a_at, mid)
    };
    let left_len = (a_split - a.start) + (b_split - b.start);
    if left_len == 0 || left_len == a.len() + b.len() {
        // Degenerate split (possible only at a cutoff of one element);
        // recursing would make no progress.
        unsafe { seq_merge(src, a, b, dst, cmp) };
        return;
    }
    let left_a = a.start..a_split;
    let left_b = b.start..b_split;
    let src_ptr = raw::ConstPtr(src);
    let dst_ptr = raw::MutPtr(dst);

    let latch = Latch::new(1);
    let scheduled = {
        let left_a = left_a.clone();
        let left_b = left_b.clone();
        let task: ChunkTask = Box::new(move || {
            // SAFETY: the halves write disjoint regions of `dst`, and the
            // parent waits on the latch before returning.
            let src_ptr = src_ptr;
            let dst_ptr = dst_ptr;
            unsafe { par_merge(scheduler, src_ptr.0, left_a, left_b, dst_ptr.0, cmp) };
        });
        // SAFETY: the wait below outlives the task.
        schedule_task(&latch, unsafe { erase(task) }, scheduler)
    };
    let right = unwind::halt_unwinding(|| unsafe {
        par_merge(
            scheduler,
            src,
            a_split..a.end,
            b_split..b.end,
            dst.add(left_len),
            cmp,
        )
    });
    let left = if scheduled {
        Ok(())
    } else {
        // The pool is shutting down; finish the left half on this thread.
        unwind::halt_unwinding(|| unsafe { par_merge(scheduler, src, left_a, left_b, dst, cmp) })
    };
    scheduler.wait_for(&latch);
    if let Err(payload) = right {
        unwind::resume_unwinding(payload);
    }
    if let Err(payload) = left {
        unwind::resume_unwinding(payload);
    }
}

/// Two-finger merge of the sorted runs `a` and `b` of `src` into `dst`,
/// taking from `a` on ties.
///
/// # Safety
///
/// Same contract as [`par_merge`].
unsafe fn seq_merge<T, C>(src: *const T, a: Range<usize>, b: Range<usize>, dst: *mut T, cmp: &C)
where
    C: Fn(&T, &T) -> Ordering,
{
    let mut ai = a.start;
    let mut bi = b.start;
    let mut out = dst;
    unsafe {
        while ai < a.end && bi < b.end {
            if cmp(&*src.add(bi), &*src.add(ai)) == Ordering::Less {
                ptr::copy_nonoverlapping(src.add(bi), out, 1);
                bi += 1;
            } else {
                ptr::copy_nonoverlapping(src.add(ai), out, 1);
                ai += 1;
            }
            out = out.add(1);
        }
        if ai < a.end {
            ptr::copy_nonoverlapping(src.add(ai), out, a.end - ai);
            out = out.add(a.end - ai);
        }
        if bi < b.end {
            ptr::copy_nonoverlapping(src.add(bi), out, b.end - bi);
        }
    }
}

/// Binary search for the first index in a sorted run whose element fails
/// `pred`, which must hold on a prefix of the run.
///
/// # Safety
///
/// `src` must be valid for reads over `range`.
unsafe fn partition_point<T, P>(src: *const T, range: Range<usize>, pred: P) -> usize
where
    P: Fn(&T) -> bool,
{
    let mut lo = range.start;
    let mut hi = range.end;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(unsafe { &*src.add(mid) }) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> TaskScheduler {
        let scheduler = TaskScheduler::new(4, true);
        scheduler.start();
        scheduler
    }

    // Large enough that i64 payloads exceed the sequential cutoff.
    const BIG: usize = 100_000;

    #[test]
    fn reduce_matches_sequential_fold() {
        let ts = scheduler();
        let items: Vec<i64> = (1..=BIG as i64).collect();
        let total = reduce_with(&ts, &items, 0, |a, b| a + b);
        assert_eq!(total, (BIG as i64) * (BIG as i64 + 1) / 2);
        ts.stop(true);
    }

    #[test]
    fn transform_maps_pointwise() {
        let ts = scheduler();
        let input: Vec<i64> = (0..BIG as i64).collect();
        let mut output = vec![0i64; BIG];
        transform_with(&ts, &input, &mut output, |x| x * 2);
        assert!(output.iter().enumerate().all(|(i, &v)| v == 2 * i as i64));
        ts.stop(true);
    }

    #[test]
    fn scan_in_place_matches_sequential() {
        let ts = scheduler();
        let mut items = vec![1i64; BIG];
        scan_in_place_with(&ts, &mut items, |a, b| a + b);
        assert!(items.iter().enumerate().all(|(i, &v)| v == i as i64 + 1));
        ts.stop(true);
    }

    #[test]
    fn extrema_prefer_the_leftmost() {
        let ts = scheduler();
        let mut items = vec![5i64; BIG];
        items[BIG / 3] = 1;
        items[2 * BIG / 3] = 1;
        let min = min_element_with(&ts, &items, |a, b| a.cmp(b)).unwrap();
        assert!(std::ptr::eq(min, &items[BIG / 3]));
        ts.stop(true);
    }

    #[test]
    fn sort_orders_a_reversed_slice() {
        let ts = scheduler();
        let mut items: Vec<i64> = (0..BIG as i64).rev().collect();
        sort_with(&ts, &mut items);
        assert!(items.windows(2).all(|w| w[0] <= w[1]));
        ts.stop(true);
    }

    #[test]
    fn small_inputs_run_sequentially() {
        let ts = scheduler();
        let mut items = vec![5, 1, 4, 2, 3];
        sort_with(&ts, &mut items);
        assert_eq!(items, vec![1, 2, 3, 4, 5]);
        assert_eq!(reduce_with(&ts, &[1, 2, 3], 0, |a, b| a + b), 6);
        ts.stop(true);
    }
}
