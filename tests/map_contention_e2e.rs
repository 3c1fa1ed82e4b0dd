//! Map behaviour under sustained insertion with concurrent readers:
//! the table grows through many resizes while readers observe a fixed
//! key without interruption.

use gridlock::ConcurrentLongMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

// Debug builds pay heavily for per-entry allocation; exercise the same
// number of resize generations with fewer keys.
const KEYS: i64 = if cfg!(debug_assertions) { 200_000 } else { 1_000_000 };
const FIXED_KEY: i64 = 12_345;
const READERS: usize = 7;

#[test]
fn fixed_key_reads_survive_growth() {
    let map: Arc<ConcurrentLongMap<Box<i64>>> = Arc::new(ConcurrentLongMap::new());
    {
        let guard = map.guard();
        map.put(FIXED_KEY, Box::new(FIXED_KEY), &guard);
    }

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let map = Arc::clone(&map);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut reads = 0u64;
                while !done.load(Ordering::Relaxed) {
                    let guard = map.guard();
                    let value = map.get(FIXED_KEY, &guard).expect("fixed key vanished");
                    assert_eq!(**value, FIXED_KEY);
                    assert!(map.contains_key(FIXED_KEY));
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    {
        let guard = map.guard();
        for key in 0..=KEYS {
            if key != FIXED_KEY {
                map.put(key, Box::new(key), &guard);
            }
        }
    }

    done.store(true, Ordering::Relaxed);
    for reader in readers {
        let reads = reader.join().unwrap();
        assert!(reads > 0, "reader made no progress");
    }

    // FIXED_KEY is inside 0..=KEYS, so the writer skipped it once
    assert_eq!(map.size(), (KEYS + 1) as usize);
    let guard = map.guard();
    for key in (0..=KEYS).step_by(997) {
        assert_eq!(**map.get(key, &guard).expect("lost key"), key);
    }
}

#[test]
fn parallel_writers_then_full_verification() {
    let map: Arc<ConcurrentLongMap<i64>> = Arc::new(ConcurrentLongMap::new());
    let writers: i64 = 4;
    let per_writer: i64 = KEYS / 20;

    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..per_writer {
                    let key = w * per_writer + i;
                    let guard = map.guard();
                    map.put(key, !key, &guard);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.size(), (writers * per_writer) as usize);
    let guard = map.guard();
    for key in 0..writers * per_writer {
        assert_eq!(map.get(key, &guard), Some(&!key));
    }
}
