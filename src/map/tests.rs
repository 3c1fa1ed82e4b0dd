use super::*;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn put_get_remove_basics() {
    let map = ConcurrentLongMap::new();
    let guard = map.guard();

    assert!(map.get(1, &guard).is_none());
    assert!(map.put(1, "one", &guard).is_none());
    assert_eq!(map.get(1, &guard), Some(&"one"));
    assert_eq!(map.put(1, "uno", &guard), Some(&"one"));
    assert_eq!(map.get(1, &guard), Some(&"uno"));

    assert_eq!(map.remove(1, &guard), Some(&"uno"));
    assert!(map.get(1, &guard).is_none());
    assert!(map.remove(1, &guard).is_none());
}

#[test]
fn negative_and_extreme_keys() {
    let map = ConcurrentLongMap::new();
    let guard = map.guard();
    for key in [i64::MIN, -1, 0, 1, i64::MAX] {
        map.put(key, key.wrapping_mul(3), &guard);
    }
    for key in [i64::MIN, -1, 0, 1, i64::MAX] {
        assert_eq!(map.get(key, &guard), Some(&key.wrapping_mul(3)));
    }
    assert_eq!(map.size(), 5);
}

#[test]
fn put_if_absent_keeps_existing() {
    let map = ConcurrentLongMap::new();
    let guard = map.guard();

    assert!(map.put_if_absent(7, 70, &guard).is_none());
    assert_eq!(map.put_if_absent(7, 71, &guard), Some(&70));
    assert_eq!(map.get(7, &guard), Some(&70));
    assert_eq!(map.size(), 1);
}

#[test]
fn replace_only_mutates_mapped_keys() {
    let map = ConcurrentLongMap::new();
    let guard = map.guard();

    assert!(map.replace(3, 30, &guard).is_none());
    assert!(map.get(3, &guard).is_none());

    map.put(3, 31, &guard);
    assert_eq!(map.replace(3, 32, &guard), Some(&31));
    assert_eq!(map.get(3, &guard), Some(&32));
}

#[test]
fn replace_expect_compares_values() {
    let map = ConcurrentLongMap::new();
    let guard = map.guard();

    assert!(map.replace_expect(5, &50, 51, &guard).is_none());

    map.put(5, 50, &guard);
    // wrong expectation: returns current, no change
    assert_eq!(map.replace_expect(5, &99, 51, &guard), Some(&50));
    assert_eq!(map.get(5, &guard), Some(&50));
    // right expectation
    assert_eq!(map.replace_expect(5, &50, 51, &guard), Some(&50));
    assert_eq!(map.get(5, &guard), Some(&51));
}

#[test]
fn remove_expect_and_remove_if() {
    let map = ConcurrentLongMap::new();
    let guard = map.guard();
    map.put(9, 90, &guard);

    assert_eq!(map.remove_expect(9, &91, &guard), Some(&90));
    assert!(map.contains_key(9));
    assert_eq!(map.remove_expect(9, &90, &guard), Some(&90));
    assert!(!map.contains_key(9));

    map.put(9, 92, &guard);
    assert_eq!(map.remove_if(9, |v| *v < 10, &guard), Some(&92));
    assert!(map.contains_key(9));
    assert_eq!(map.remove_if(9, |v| *v > 10, &guard), Some(&92));
    assert!(!map.contains_key(9));
    assert_eq!(map.size(), 0);
}

#[test]
fn compute_inserts_updates_and_removes() {
    let map = ConcurrentLongMap::new();
    let guard = map.guard();

    // absent -> insert
    assert_eq!(
        map.compute(2, |key, old| {
            assert_eq!(key, 2);
            assert!(old.is_none());
            Some(20)
        }, &guard),
        Some(&20)
    );
    // present -> update
    assert_eq!(
        map.compute(2, |_, old| old.map(|v| v + 1), &guard),
        Some(&21)
    );
    // present -> remove
    assert!(map.compute(2, |_, _| None, &guard).is_none());
    assert!(!map.contains_key(2));
    assert_eq!(map.size(), 0);
}

#[test]
fn compute_absent_returning_none_leaves_no_trace() {
    let map: ConcurrentLongMap<u32> = ConcurrentLongMap::new();
    let guard = map.guard();
    assert!(map.compute(4, |_, _| None, &guard).is_none());
    assert!(!map.contains_key(4));
    assert_eq!(map.size(), 0);
    // the erased placeholder must not wedge the bucket
    assert!(map.put(4, 40, &guard).is_none());
    assert_eq!(map.get(4, &guard), Some(&40));
}

#[test]
fn compute_panic_erases_placeholder() {
    let map: Arc<ConcurrentLongMap<u32>> = Arc::new(ConcurrentLongMap::new());
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let guard = map.guard();
        map.compute(8, |_, _| -> Option<u32> { panic!("compute failed") }, &guard);
    }));
    assert!(result.is_err());

    // bucket stays usable afterwards
    let guard = map.guard();
    assert!(!map.contains_key(8));
    assert!(map.put(8, 80, &guard).is_none());
    assert_eq!(map.get(8, &guard), Some(&80));
}

#[test]
fn compute_if_absent_runs_once_and_respects_existing() {
    let map = ConcurrentLongMap::new();
    let guard = map.guard();

    assert_eq!(map.compute_if_absent(6, |_| Some(60), &guard), Some(&60));
    // existing mapping: the function must not run
    assert_eq!(
        map.compute_if_absent(6, |_| panic!("must not be invoked"), &guard),
        Some(&60)
    );
    // declining to insert
    assert!(map.compute_if_absent(7, |_| None, &guard).is_none());
    assert!(!map.contains_key(7));
}

#[test]
fn compute_if_present_ignores_absent_keys() {
    let map = ConcurrentLongMap::new();
    let guard = map.guard();

    assert!(map
        .compute_if_present(1, |_, _: &u32| panic!("must not be invoked"), &guard)
        .is_none());

    map.put(1, 10u32, &guard);
    assert_eq!(
        map.compute_if_present(1, |_, v| Some(v + 5), &guard),
        Some(&15)
    );
    assert!(map.compute_if_present(1, |_, _| None, &guard).is_none());
    assert!(!map.contains_key(1));
}

#[test]
fn merge_combines_and_removes() {
    let map = ConcurrentLongMap::new();
    let guard = map.guard();

    assert_eq!(map.merge(3, 1u64, |_, _| unreachable!(), &guard), Some(&1));
    assert_eq!(map.merge(3, 1, |old, def| Some(old + def), &guard), Some(&2));
    assert!(map.merge(3, 1, |_, _| None, &guard).is_none());
    assert!(!map.contains_key(3));
    assert_eq!(map.size(), 0);
}

#[test]
fn size_tracks_mutations() {
    let map = ConcurrentLongMap::new();
    let guard = map.guard();
    assert!(map.is_empty());

    for key in 0..100 {
        map.put(key, key, &guard);
    }
    assert_eq!(map.size(), 100);
    assert!(!map.is_empty());

    for key in 0..50 {
        map.remove(key, &guard);
    }
    assert_eq!(map.size(), 50);

    map.clear();
    assert_eq!(map.size(), 0);
    assert!(map.is_empty());
}

#[test]
fn contains_value_and_get_or_default() {
    let map = ConcurrentLongMap::new();
    let guard = map.guard();
    map.put(1, 11, &guard);

    assert!(map.contains_value(&11));
    assert!(!map.contains_value(&12));
    assert_eq!(map.get_or_default(1, 0), 11);
    assert_eq!(map.get_or_default(2, 0), 0);
}

#[test]
fn growth_preserves_all_entries() {
    // well past several resize thresholds from the default capacity
    let map = ConcurrentLongMap::new();
    let guard = map.guard();
    let n: i64 = 10_000;

    for key in 0..n {
        assert!(map.put(key, key * 2, &guard).is_none());
    }
    assert_eq!(map.size(), n as usize);
    for key in 0..n {
        assert_eq!(map.get(key, &guard), Some(&(key * 2)), "lost key {key}");
    }
}

#[test]
fn iteration_sees_preexisting_entries() {
    let map = ConcurrentLongMap::new();
    let guard = map.guard();
    let n: i64 = 3_000;
    for key in 0..n {
        map.put(key, key, &guard);
    }

    let seen: HashSet<i64> = map.keys(&guard).collect();
    assert_eq!(seen.len(), n as usize);
    for key in 0..n {
        assert!(seen.contains(&key), "iterator missed key {key}");
    }

    let value_sum: i64 = map.values(&guard).sum();
    assert_eq!(value_sum, n * (n - 1) / 2);
}

#[test]
fn iteration_during_concurrent_growth() {
    let map: Arc<ConcurrentLongMap<i64>> = Arc::new(ConcurrentLongMap::new());
    let preexisting: i64 = 2_000;
    {
        let guard = map.guard();
        for key in 0..preexisting {
            map.put(key, key, &guard);
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let map = Arc::clone(&map);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut key = preexisting;
            while !stop.load(Ordering::Relaxed) {
                let guard = map.guard();
                map.put(key, key, &guard);
                key += 1;
            }
        })
    };

    for _ in 0..20 {
        let guard = map.guard();
        let seen: HashSet<i64> = map.keys(&guard).collect();
        for key in 0..preexisting {
            assert!(seen.contains(&key), "iterator missed preexisting key {key}");
        }
    }

    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
}

#[test]
fn concurrent_distinct_key_writes() {
    let map: Arc<ConcurrentLongMap<i64>> = Arc::new(ConcurrentLongMap::new());
    let threads: i64 = 8;
    let per_thread: i64 = 5_000;
    let barrier = Arc::new(Barrier::new(threads as usize));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let map = Arc::clone(&map);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    let key = t * per_thread + i;
                    let guard = map.guard();
                    assert!(map.put(key, key, &guard).is_none());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.size(), (threads * per_thread) as usize);
    let guard = map.guard();
    for key in 0..threads * per_thread {
        assert_eq!(map.get(key, &guard), Some(&key));
    }
}

#[test]
fn readers_stay_consistent_through_resizes() {
    let map: Arc<ConcurrentLongMap<String>> = Arc::new(ConcurrentLongMap::new());
    let fixed_key = 12_345;
    {
        let guard = map.guard();
        map.put(fixed_key, "fixed".to_string(), &guard);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let map = Arc::clone(&map);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut reads = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let guard = map.guard();
                    let value = map.get(fixed_key, &guard);
                    assert_eq!(value.map(String::as_str), Some("fixed"));
                    assert!(map.contains_key(fixed_key));
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    // force repeated resizes while the readers hammer the fixed key
    {
        let guard = map.guard();
        for key in 0..50_000 {
            if key != fixed_key {
                map.put(key, key.to_string(), &guard);
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert_eq!(map.size(), 50_000);
}

#[test]
fn concurrent_put_remove_same_keyspace() {
    let map: Arc<ConcurrentLongMap<i64>> = Arc::new(ConcurrentLongMap::new());
    let keys: i64 = 512;
    let iterations = 2_000;

    let writer = |seed: i64| {
        let map = Arc::clone(&map);
        thread::spawn(move || {
            for i in 0..iterations {
                let key = (seed.wrapping_mul(31).wrapping_add(i)) & (keys - 1);
                let guard = map.guard();
                if i % 3 == 0 {
                    map.remove(key, &guard);
                } else {
                    map.put(key, i, &guard);
                }
            }
        })
    };

    let handles: Vec<_> = (0..6).map(writer).collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // every key appears at most once and size agrees with a full scan
    let guard = map.guard();
    let seen: Vec<i64> = map.keys(&guard).collect();
    let unique: HashSet<i64> = seen.iter().copied().collect();
    assert_eq!(seen.len(), unique.len(), "duplicate key in chains");
    assert_eq!(map.size(), unique.len());
}

#[test]
fn capacity_helpers() {
    assert_eq!(capacity_for(1), 1);
    assert_eq!(capacity_for(16), 16);
    assert_eq!(capacity_for(17), 32);
    assert_eq!(capacity_for(MAXIMUM_CAPACITY), MAXIMUM_CAPACITY);
    assert_eq!(capacity_for(MAXIMUM_CAPACITY + 1), MAXIMUM_CAPACITY);

    assert_eq!(target_threshold(16, 0.75), 12);
    assert_eq!(
        target_threshold(MAXIMUM_CAPACITY, f32::MAX),
        THRESHOLD_NO_RESIZE
    );
}

#[test]
#[should_panic(expected = "invalid capacity")]
fn zero_capacity_rejected() {
    let _ = ConcurrentLongMap::<u32>::with_capacity(0, 0.75);
}

#[test]
#[should_panic(expected = "invalid load factor")]
fn non_finite_load_factor_rejected() {
    let _ = ConcurrentLongMap::<u32>::with_capacity(16, f32::NAN);
}

#[test]
fn with_expected_avoids_early_resize() {
    let map = ConcurrentLongMap::with_expected(1_000, 0.75);
    let guard = map.guard();
    for key in 0..1_000 {
        map.put(key, key, &guard);
    }
    assert_eq!(map.size(), 1_000);
}

#[test]
fn aggressive_load_factor_for_contention() {
    // the shape the area lock uses: large table, tiny load factor
    let map = ConcurrentLongMap::with_capacity(128, 0.2);
    let guard = map.guard();
    for key in 0..64 {
        map.put(key, key, &guard);
    }
    assert_eq!(map.size(), 64);
    for key in 0..64 {
        assert_eq!(map.get(key, &guard), Some(&key));
    }
}

#[test]
fn colliding_keys_share_a_bucket_correctly() {
    // keys crafted to collide in a 16-bin table via the inverse mixer
    let map = ConcurrentLongMap::with_capacity(16, 0.75);
    let guard = map.guard();
    let colliding: Vec<i64> = (0..8)
        .map(|i| crate::util::hash::inv_mix(i << 4))
        .collect();

    for (i, &key) in colliding.iter().enumerate() {
        assert!(map.put(key, i, &guard).is_none());
    }
    for (i, &key) in colliding.iter().enumerate() {
        assert_eq!(map.get(key, &guard), Some(&i));
    }
    // removing from the middle of the chain keeps the rest reachable
    assert_eq!(map.remove(colliding[3], &guard), Some(&3));
    for (i, &key) in colliding.iter().enumerate() {
        if i != 3 {
            assert_eq!(map.get(key, &guard), Some(&i));
        }
    }
}
