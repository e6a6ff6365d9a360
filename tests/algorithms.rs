//! End-to-end tests for the parallel algorithms, checked against their
//! sequential counterparts.

use std::sync::atomic::{AtomicU64, Ordering};

use millrace::algorithms;
use millrace::TaskScheduler;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn started(threads: usize) -> TaskScheduler {
    let scheduler = TaskScheduler::new(threads, true);
    scheduler.start();
    scheduler
}

/// Large enough that 8-byte elements exceed the sequential cutoff.
const BIG: usize = 200_000;

#[test]
fn reduce_small_range() {
    let scheduler = started(4);
    let items: Vec<u64> = (1..=1000).collect();
    assert_eq!(
        algorithms::reduce_with(&scheduler, &items, 0, |a, b| a + b),
        500_500
    );
    scheduler.stop(true);
}

#[test]
fn reduce_is_a_left_fold_under_associativity() {
    let scheduler = started(4);
    // String concatenation is associative but not commutative, so any
    // chunk-order mistake shows up immediately.
    let items: Vec<String> = (0..50_000).map(|n| format!("{n},")).collect();
    let parallel = algorithms::reduce_with(&scheduler, &items, String::new(), |a, b| a + &b);
    let sequential: String = items.concat();
    assert_eq!(parallel, sequential);
    scheduler.stop(true);
}

#[test]
fn sort_small_range() {
    let scheduler = started(4);
    let mut items = vec![5, 1, 4, 2, 3];
    algorithms::sort_with(&scheduler, &mut items);
    assert_eq!(items, vec![1, 2, 3, 4, 5]);
    scheduler.stop(true);
}

#[test]
fn sort_matches_std_on_random_input() {
    let scheduler = started(4);
    let mut rng = StdRng::seed_from_u64(7);
    let mut items: Vec<u64> = (0..BIG).map(|_| rng.gen_range(0..1_000_000)).collect();
    let mut expected = items.clone();
    algorithms::sort_with(&scheduler, &mut items);
    expected.sort_unstable();
    assert_eq!(items, expected);
    scheduler.stop(true);
}

#[test]
fn stable_sort_preserves_order_of_equal_keys() {
    let scheduler = started(4);
    let mut rng = StdRng::seed_from_u64(11);
    // Few distinct keys so that ties are everywhere; the payload records the
    // original position.
    let mut items: Vec<(u8, u32)> = (0..BIG as u32)
        .map(|position| (rng.gen_range(0..8), position))
        .collect();
    let mut expected = items.clone();
    algorithms::stable_sort_by_with(&scheduler, &mut items, |a, b| a.0.cmp(&b.0));
    expected.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(items, expected);
    scheduler.stop(true);
}

#[test]
fn scan_small_range() {
    let scheduler = started(4);
    let input = vec![1u64; 5];
    let mut output = vec![0u64; 5];
    algorithms::scan_with(&scheduler, &input, &mut output, |a, b| a + b);
    assert_eq!(output, vec![1, 2, 3, 4, 5]);
    scheduler.stop(true);
}

#[test]
fn scan_matches_sequential_on_random_input() {
    let scheduler = started(4);
    let mut rng = StdRng::seed_from_u64(13);
    let input: Vec<u64> = (0..BIG).map(|_| rng.gen_range(0..100)).collect();
    let mut output = vec![0u64; BIG];
    algorithms::scan_with(&scheduler, &input, &mut output, |a, b| a + b);

    let mut expected = Vec::with_capacity(BIG);
    let mut acc = 0u64;
    for &value in &input {
        acc += value;
        expected.push(acc);
    }
    assert_eq!(output, expected);
    scheduler.stop(true);
}

#[test]
fn scan_in_place_aliases_input_and_output() {
    let scheduler = started(4);
    let mut items: Vec<u64> = (0..BIG as u64).collect();
    let mut expected = items.clone();
    algorithms::scan_in_place_with(&scheduler, &mut items, |a, b| a + b);
    let mut acc = 0u64;
    for value in expected.iter_mut() {
        acc += *value;
        *value = acc;
    }
    assert_eq!(items, expected);
    scheduler.stop(true);
}

#[test]
fn for_each_touches_every_element() {
    let scheduler = started(4);
    let items: Vec<u64> = (0..BIG as u64).collect();
    let total = AtomicU64::new(0);
    algorithms::for_each_with(&scheduler, &items, |&value| {
        total.fetch_add(value, Ordering::Relaxed);
    });
    let n = BIG as u64;
    assert_eq!(total.load(Ordering::Relaxed), n * (n - 1) / 2);
    scheduler.stop(true);
}

#[test]
fn fill_overwrites_every_element() {
    let scheduler = started(4);
    let mut items = vec![0u64; BIG];
    algorithms::fill_with(&scheduler, &mut items, 9);
    assert!(items.iter().all(|&value| value == 9));
    scheduler.stop(true);
}

#[test]
fn transform_and_in_place_variant_agree() {
    let scheduler = started(4);
    let input: Vec<u64> = (0..BIG as u64).collect();
    let mut output = vec![0u64; BIG];
    algorithms::transform_with(&scheduler, &input, &mut output, |&x| x * 3 + 1);

    let mut in_place = input.clone();
    algorithms::transform_in_place_with(&scheduler, &mut in_place, |&x| x * 3 + 1);
    assert_eq!(output, in_place);
    scheduler.stop(true);
}

#[test]
fn map_reduce_maps_then_folds() {
    let scheduler = started(4);
    let items: Vec<u64> = (1..=BIG as u64).collect();
    // Sum of squares, with the mapped initial value folded in.
    let total = algorithms::map_reduce_with(&scheduler, &items, 0, |&x| x * x, |a, b| a + b);
    let expected: u64 = items.iter().map(|&x| x * x).sum();
    assert_eq!(total, expected);
    scheduler.stop(true);
}

#[test]
fn count_if_matches_filter_count() {
    let scheduler = started(4);
    let items: Vec<u64> = (0..BIG as u64).collect();
    let count = algorithms::count_if_with(&scheduler, &items, |&x| x % 3 == 0);
    assert_eq!(count, items.iter().filter(|&&x| x % 3 == 0).count());
    scheduler.stop(true);
}

#[test]
fn extrema_match_std_and_break_ties_left() {
    let scheduler = started(4);
    let mut rng = StdRng::seed_from_u64(17);
    let items: Vec<u32> = (0..BIG).map(|_| rng.gen_range(0..1000)).collect();

    let min = algorithms::min_element_with(&scheduler, &items, |a, b| a.cmp(b)).unwrap();
    let max = algorithms::max_element_with(&scheduler, &items, |a, b| a.cmp(b)).unwrap();
    assert_eq!(*min, *items.iter().min().unwrap());
    assert_eq!(*max, *items.iter().max().unwrap());

    // The returned reference is the first occurrence of the extreme value.
    let first_min = items.iter().position(|v| v == min).unwrap();
    assert!(std::ptr::eq(min, &items[first_min]));
    let first_max = items.iter().position(|v| v == max).unwrap();
    assert!(std::ptr::eq(max, &items[first_max]));
    scheduler.stop(true);
}

#[test]
fn empty_and_tiny_inputs() {
    let scheduler = started(2);
    let empty: Vec<u64> = Vec::new();
    assert_eq!(algorithms::reduce_with(&scheduler, &empty, 7, |a, b| a + b), 7);
    assert!(algorithms::min_element_with(&scheduler, &empty, |a, b| a.cmp(b)).is_none());

    let mut one = vec![3u64];
    algorithms::sort_with(&scheduler, &mut one);
    assert_eq!(one, vec![3]);
    algorithms::scan_in_place_with(&scheduler, &mut one, |a, b| a + b);
    assert_eq!(one, vec![3]);
    scheduler.stop(true);
}
