// Copyright 2020-2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use concache::{CacheBuilder, CacheError, ConfigError, Item, StoreMode, Ttl};
use rand::distributions::{Bernoulli, Distribution};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::Debug).try_init();
}

fn no_ttl<K, V>() -> CacheBuilder<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    CacheBuilder::new().ttl_disabled()
}

// P1: put/get round-trips in set mode.
#[test]
fn put_then_get_returns_the_stored_value() {
    let cache = no_ttl::<&str, i32>().build().unwrap();
    cache.put("a", 1);
    assert_eq!(cache.get(&"a").and_then(|v| v.into_single()), Some(1));
}

// P2: delete removes the key.
#[test]
fn delete_removes_the_key() {
    let cache = no_ttl::<&str, i32>().build().unwrap();
    cache.put("a", 1);
    cache.delete(&"a");
    assert!(cache.get(&"a").is_none());
}

// P3: duplicate_bag preserves insertion order and count.
#[test]
fn duplicate_bag_preserves_insertion_order() {
    let cache = no_ttl::<&str, i32>().mode(StoreMode::DuplicateBag).build().unwrap();
    cache.put("a", 1);
    cache.put("a", 2);
    cache.put("a", 3);
    let values = cache.get(&"a").unwrap().into_many();
    assert_eq!(values, vec![1, 2, 3]);
}

// P4: insert_new refuses to overwrite.
#[test]
fn insert_new_refuses_an_existing_key() {
    let cache = no_ttl::<&str, i32>().build().unwrap();
    cache.insert_new("a", 1).unwrap();
    let err = cache.insert_new("a", 2).unwrap_err();
    assert!(matches!(err, CacheError::AlreadyExists));
    assert_eq!(cache.get(&"a").and_then(|v| v.into_single()), Some(1));
}

// P5: concurrent update is atomic per key.
#[test]
fn concurrent_update_is_atomic_per_key() {
    let cache = no_ttl::<&str, i32>().build().unwrap();
    cache.put("counter", 0);

    let n = 50;
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || {
                cache
                    .update::<_, ()>("counter", |current| Ok(concache::Stored::from(current.copied().unwrap_or(0) + 1)))
                    .unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(cache.get(&"counter").and_then(|v| v.into_single()), Some(n as i32));
}

// P6: isolated is reentrant on the same thread.
#[test]
fn isolated_is_reentrant_on_the_same_thread() {
    let cache = no_ttl::<&str, i32>().build().unwrap();
    cache.put("a", 7);
    let result = cache.isolated(&"a", || cache.isolated(&"a", || cache.get(&"a").and_then(|v| v.into_single())));
    assert_eq!(result, Some(7));
}

// P7: get never blocks behind a held lock.
#[test]
fn get_is_not_blocked_by_a_held_lock() {
    let cache = no_ttl::<&str, i32>().build().unwrap();
    cache.put("a", 1);

    let held = Arc::new(Mutex::new(false));
    let release = Arc::new(Mutex::new(false));
    let held2 = held.clone();
    let release2 = release.clone();
    let cache2 = cache.clone();
    let holder = thread::spawn(move || {
        cache2.isolated(&"a", || {
            *held2.lock().unwrap() = true;
            while !*release2.lock().unwrap() {
                thread::sleep(Duration::from_millis(1));
            }
        });
    });

    while !*held.lock().unwrap() {
        thread::sleep(Duration::from_millis(1));
    }

    let start = std::time::Instant::now();
    assert_eq!(cache.get(&"a").and_then(|v| v.into_single()), Some(1));
    assert!(start.elapsed() < Duration::from_millis(200));

    *release.lock().unwrap() = true;
    holder.join().unwrap();
}

// P8: try_isolated fails with Locked iff another owner holds the key.
#[test]
fn try_isolated_reports_locked_only_while_another_owner_holds_it() {
    let cache = no_ttl::<&str, i32>().build().unwrap();
    cache.put("a", 1);

    assert!(cache.try_isolated(&"a", || ()).is_ok());

    let held = Arc::new(Mutex::new(false));
    let release = Arc::new(Mutex::new(false));
    let held2 = held.clone();
    let release2 = release.clone();
    let cache2 = cache.clone();
    let holder = thread::spawn(move || {
        cache2.isolated(&"a", || {
            *held2.lock().unwrap() = true;
            while !*release2.lock().unwrap() {
                thread::sleep(Duration::from_millis(1));
            }
        });
    });

    while !*held.lock().unwrap() {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(matches!(cache.try_isolated(&"a", || ()), Err(CacheError::Locked)));

    *release.lock().unwrap() = true;
    holder.join().unwrap();
    assert!(cache.try_isolated(&"a", || ()).is_ok());
}

// S1: global_ttl expiry, survives a read well before the deadline.
#[test]
fn global_ttl_expires_a_key_after_the_deadline() {
    init_logger();
    let cache = CacheBuilder::<&str, i32>::new()
        .ttl_check_interval(Duration::from_millis(10))
        .global_ttl(Duration::from_millis(50))
        .build()
        .unwrap();

    cache.put("a", 1);
    thread::sleep(Duration::from_millis(40));
    assert_eq!(cache.get(&"a").and_then(|v| v.into_single()), Some(1));
    thread::sleep(Duration::from_millis(80));
    assert!(cache.get(&"a").is_none());
}

// S2: touch (via put/update/update_existing/touch) pushes the deadline out.
#[test]
fn touch_extends_a_keys_deadline() {
    init_logger();
    let cache = CacheBuilder::<&str, i32>::new()
        .ttl_check_interval(Duration::from_millis(10))
        .global_ttl(Duration::from_millis(50))
        .build()
        .unwrap();

    cache.put("a", 1);
    thread::sleep(Duration::from_millis(30));
    cache.touch(&"a");
    thread::sleep(Duration::from_millis(30));
    assert!(cache.get(&"a").is_some(), "key should still be alive after touch pushed its deadline out");
    thread::sleep(Duration::from_millis(100));
    assert!(cache.get(&"a").is_none());
}

// S3: an explicit infinity TTL overrides a cache with TTL enabled.
#[test]
fn an_item_tagged_infinity_never_expires() {
    init_logger();
    let cache = CacheBuilder::<&str, i32>::new()
        .ttl_check_interval(Duration::from_millis(10))
        .global_ttl(Duration::from_millis(50))
        .build()
        .unwrap();

    cache.put("a", Item::infinite(1));
    thread::sleep(Duration::from_millis(150));
    assert_eq!(cache.get(&"a").and_then(|v| v.into_single()), Some(1));
}

// S4: touch_on_read keeps a key alive across reads, but not past the last one.
#[test]
fn touch_on_read_keeps_a_key_alive_across_reads() {
    init_logger();
    let cache = CacheBuilder::<&str, i32>::new()
        .ttl_check_interval(Duration::from_millis(10))
        .global_ttl(Duration::from_millis(50))
        .touch_on_read(true)
        .build()
        .unwrap();

    cache.put("a", 1);
    thread::sleep(Duration::from_millis(40));
    assert_eq!(cache.get(&"a").and_then(|v| v.into_single()), Some(1));
    thread::sleep(Duration::from_millis(40));
    assert_eq!(cache.get(&"a").and_then(|v| v.into_single()), Some(1));
    thread::sleep(Duration::from_millis(150));
    assert!(cache.get(&"a").is_none());
}

// S5: a no_update write/update leaves the originally-scheduled deadline alone.
#[test]
fn no_update_ttl_leaves_the_original_deadline_in_place() {
    init_logger();
    let cache = CacheBuilder::<&str, i32>::new()
        .ttl_check_interval(Duration::from_millis(10))
        .global_ttl(Duration::from_millis(50))
        .build()
        .unwrap();

    cache.put("a", 1);
    thread::sleep(Duration::from_millis(40));
    cache.put("a", Item::new(2, Ttl::NoUpdate));
    cache.update::<_, ()>("a", |_| Ok(Item::new(3, Ttl::NoUpdate).into())).unwrap();
    assert_eq!(cache.get(&"a").and_then(|v| v.into_single()), Some(3));
    thread::sleep(Duration::from_millis(40));
    assert!(cache.get(&"a").is_none(), "the original deadline (set at the first put) should still apply");
}

// S6: independent caches never see each other's entries.
#[test]
fn caches_are_independent_of_one_another() {
    let cache1 = no_ttl::<&str, i32>().build().unwrap();
    let cache2 = no_ttl::<&str, i32>().build().unwrap();

    cache1.put("a", 1);
    cache2.put("b", 2);

    assert_eq!(cache1.get(&"a").and_then(|v| v.into_single()), Some(1));
    assert!(cache1.get(&"b").is_none());
    assert_eq!(cache2.get(&"b").and_then(|v| v.into_single()), Some(2));
    assert!(cache2.get(&"a").is_none());
}

// S7: the callback stream matches the writes that produced it.
#[test]
fn callbacks_report_updates_and_deletes_in_order() {
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let cache = no_ttl::<&str, i32>()
        .callback(move |event| {
            let mut events = sink.lock().unwrap();
            match event {
                concache::CacheEvent::Update { key, value, .. } => events.push(format!("update:{key}:{value}")),
                concache::CacheEvent::Delete { key, .. } => events.push(format!("delete:{key}")),
            }
        })
        .build()
        .unwrap();

    cache.put("a", 1);
    cache.update::<_, ()>("a", |_| Ok(2.into())).unwrap();
    cache.delete(&"a");

    // callback delivery is asynchronous; give the dispatcher thread a moment.
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    loop {
        if events.lock().unwrap().len() >= 3 || std::time::Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }

    let seen = events.lock().unwrap().clone();
    assert_eq!(seen, vec!["update:a:1".to_string(), "update:a:2".to_string(), "delete:a".to_string()]);
}

// S8: isolated_timeout gives up after its deadline instead of blocking forever.
#[test]
fn isolated_timeout_gives_up_after_the_deadline() {
    let cache = no_ttl::<&str, i32>().build().unwrap();
    cache.put("a", 1);

    let held = Arc::new(Mutex::new(false));
    let release = Arc::new(Mutex::new(false));
    let held2 = held.clone();
    let release2 = release.clone();
    let cache2 = cache.clone();
    let holder = thread::spawn(move || {
        cache2.isolated(&"a", || {
            *held2.lock().unwrap() = true;
            while !*release2.lock().unwrap() {
                thread::sleep(Duration::from_millis(1));
            }
        });
    });

    while !*held.lock().unwrap() {
        thread::sleep(Duration::from_millis(1));
    }

    let start = std::time::Instant::now();
    let result = cache.isolated_timeout(&"a", Duration::from_millis(50), || ());
    assert!(matches!(result, Err(CacheError::Timeout)));
    assert!(start.elapsed() >= Duration::from_millis(50));

    *release.lock().unwrap() = true;
    holder.join().unwrap();
}

// Config validation: the five rows of the ttl_check_interval/global_ttl table.
#[test]
fn config_validation_rejects_a_missing_ttl_check_interval() {
    let err = CacheBuilder::<&str, i32>::new().build().unwrap_err();
    assert!(matches!(err, ConfigError::MissingTtlCheckInterval));
}

#[test]
fn config_validation_rejects_a_global_ttl_with_no_check_interval() {
    let err = CacheBuilder::<&str, i32>::new().global_ttl(Duration::from_millis(50)).build().unwrap_err();
    assert!(matches!(err, ConfigError::MissingTtlCheckInterval));
}

#[test]
fn config_validation_rejects_a_check_interval_with_no_global_ttl() {
    let err = CacheBuilder::<&str, i32>::new().ttl_check_interval(Duration::from_millis(10)).build().unwrap_err();
    assert!(matches!(err, ConfigError::MissingGlobalTtl));
}

#[test]
fn config_validation_rejects_a_disabled_interval_with_a_global_ttl() {
    let err =
        CacheBuilder::<&str, i32>::new().ttl_disabled().global_ttl(Duration::from_millis(50)).build().unwrap_err();
    assert!(matches!(err, ConfigError::ConflictingTtlConfig));
}

#[test]
fn config_validation_accepts_ttl_explicitly_disabled_with_no_global_ttl() {
    assert!(no_ttl::<&str, i32>().build().is_ok());
}

#[test]
fn config_validation_accepts_a_matching_interval_and_global_ttl() {
    let cache =
        CacheBuilder::<&str, i32>::new().ttl_check_interval(Duration::from_millis(10)).global_ttl(Duration::from_millis(50)).build();
    assert!(cache.is_ok());
}

// Registry: a named cache can be resolved by name, an unknown name cannot.
#[test]
fn a_named_cache_can_be_resolved_by_name() {
    let cache = no_ttl::<&str, i32>().name("integration-registry-resolve").build().unwrap();
    cache.put("a", 1);

    let resolved = concache::resolve::<&str, i32>("integration-registry-resolve").unwrap();
    assert_eq!(resolved.get(&"a").and_then(|v| v.into_single()), Some(1));
    assert_eq!(resolved.id(), cache.id());
}

#[test]
fn resolving_an_unknown_name_fails() {
    let err = concache::resolve::<&str, i32>("no-such-cache-registered-anywhere").unwrap_err();
    assert!(matches!(err, CacheError::NoSuchProcess(_)));
}

#[test]
fn unregister_frees_the_name_for_reuse() {
    let cache = no_ttl::<&str, i32>().name("integration-registry-unregister").build().unwrap();
    cache.put("a", 1);
    assert!(concache::resolve::<&str, i32>("integration-registry-unregister").is_ok());

    cache.unregister();
    let err = concache::resolve::<&str, i32>("integration-registry-unregister").unwrap_err();
    assert!(matches!(err, CacheError::NoSuchProcess(_)));

    // the caller's own handle is untouched.
    assert_eq!(cache.get(&"a").and_then(|v| v.into_single()), Some(1));

    // the name can be claimed by a brand new cache.
    let second = no_ttl::<&str, i32>().name("integration-registry-unregister").build().unwrap();
    second.put("b", 2);
    let resolved = concache::resolve::<&str, i32>("integration-registry-unregister").unwrap();
    assert_eq!(resolved.id(), second.id());
}

#[test]
fn unregister_on_an_unnamed_cache_is_a_no_op() {
    let cache = no_ttl::<&str, i32>().build().unwrap();
    cache.unregister();
    cache.unregister();
}

#[test]
fn service_handle_shuts_down_and_joins_the_background_threads_independently() {
    let cache = CacheBuilder::<&str, i32>::new()
        .ttl_check_interval(Duration::from_millis(5))
        .global_ttl(Duration::from_millis(500))
        .build()
        .unwrap();
    cache.put("a", 1);

    let handle = cache.service_handle();
    assert_eq!(handle.id(), cache.id());

    handle.shutdown();
    handle.shutdown(); // idempotent
    handle.join();
    handle.join(); // idempotent, doesn't block or double-join

    // the cache itself is still perfectly usable; only its background
    // threads stopped.
    assert_eq!(cache.get(&"a").and_then(|v| v.into_single()), Some(1));
    cache.put("b", 2);
    assert_eq!(cache.get(&"b").and_then(|v| v.into_single()), Some(2));
}

#[test]
fn dropping_the_cache_after_its_service_handle_does_not_double_join() {
    let cache = CacheBuilder::<&str, i32>::new()
        .ttl_check_interval(Duration::from_millis(5))
        .global_ttl(Duration::from_millis(500))
        .callback(|_event| {})
        .build()
        .unwrap();

    let handle = cache.service_handle();
    handle.shutdown();
    handle.join();
    drop(cache); // Cache::drop takes the same ticker handle; must be a no-op, not a panic.
}

// A panicking update closure still releases the per-key lock.
#[test]
fn a_panicking_update_closure_still_releases_the_lock() {
    let cache = no_ttl::<&str, i32>().build().unwrap();
    cache.put("a", 1);

    let cache2 = cache.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        cache2
            .update::<_, ()>("a", |_| -> Result<concache::Stored<i32>, ()> {
                panic!("intentional panic inside the update closure");
            })
            .ok();
    }));
    assert!(result.is_err());

    // the lock must have been released on unwind, or this would deadlock.
    assert!(cache.try_isolated(&"a", || ()).is_ok());
}

// Bag/duplicate_bag modes refuse single-value read-modify-write operations.
#[test]
#[should_panic(expected = "not supported for bag/duplicate_bag tables")]
fn update_panics_in_bag_mode() {
    let cache = no_ttl::<&str, i32>().mode(StoreMode::Bag).build().unwrap();
    cache.put("a", 1);
    let _ = cache.update::<_, ()>("a", |_| Ok(2.into()));
}

// update_existing reports NotExisting instead of running the closure.
#[test]
fn update_existing_reports_not_existing_without_calling_the_closure() {
    let cache = no_ttl::<&str, i32>().build().unwrap();
    let calls = AtomicUsize::new(0);
    let err = cache
        .update_existing::<_, ()>("missing", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(1.into())
        })
        .unwrap_err();
    assert!(matches!(err, concache::UpdateError::NotExisting));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// get_or_store only calls produce() once across concurrent racers.
#[test]
fn get_or_store_only_produces_once_under_contention() {
    let cache = no_ttl::<&str, i32>().build().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            thread::spawn(move || {
                cache.get_or_store("k".to_string(), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    42
                })
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.iter().all(|&v| v == 42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// size() counts values, not unique keys, in duplicate_bag mode.
#[test]
fn size_counts_values_not_keys_in_bag_modes() {
    let cache = no_ttl::<&str, i32>().mode(StoreMode::DuplicateBag).build().unwrap();
    cache.put("a", 1);
    cache.put("a", 2);
    cache.put("b", 3);
    assert_eq!(cache.size(), 3);
}

// dirty_put/dirty_delete bypass the lock manager entirely, but still mutate the store.
#[test]
fn dirty_operations_still_mutate_the_store() {
    let cache = no_ttl::<&str, i32>().build().unwrap();
    cache.dirty_put("a", 1);
    assert_eq!(cache.get(&"a").and_then(|v| v.into_single()), Some(1));
    cache.dirty_delete(&"a");
    assert!(cache.get(&"a").is_none());
}

// dirty_insert_new/dirty_update/dirty_update_existing/dirty_get_or_store all
// bypass the lock manager as well, but still behave like their locked
// counterparts under uncontended use.
#[test]
fn remaining_dirty_variants_behave_like_their_locked_counterparts() {
    let cache = no_ttl::<&str, i32>().build().unwrap();

    cache.dirty_insert_new("a", 1).unwrap();
    assert!(matches!(cache.dirty_insert_new("a", 2).unwrap_err(), CacheError::AlreadyExists));

    cache.dirty_update::<_, ()>("a", |current| Ok(concache::Stored::from(current.copied().unwrap_or(0) + 1))).unwrap();
    assert_eq!(cache.get(&"a").and_then(|v| v.into_single()), Some(2));

    cache.dirty_update_existing::<_, ()>("a", |current| Ok(concache::Stored::from(current.copied().unwrap() + 1))).unwrap();
    assert_eq!(cache.get(&"a").and_then(|v| v.into_single()), Some(3));
    assert!(matches!(cache.dirty_update_existing::<_, ()>("missing", |_| Ok(0.into())).unwrap_err(), concache::UpdateError::NotExisting));

    let produced = AtomicUsize::new(0);
    let v = cache.dirty_get_or_store("b", || {
        produced.fetch_add(1, Ordering::SeqCst);
        42
    });
    assert_eq!(v, 42);
    assert_eq!(produced.load(Ordering::SeqCst), 1);
    let v2 = cache.dirty_get_or_store("b", || {
        produced.fetch_add(1, Ordering::SeqCst);
        99
    });
    assert_eq!(v2, 42);
    assert_eq!(produced.load(Ordering::SeqCst), 1);
}

// A mixed read/write workload across many keys and threads, split roughly
// 70/30 between reads and increments by a Bernoulli draw per task, must
// still land on the exact count of increments each key received.
#[test]
fn randomized_concurrent_reads_and_writes_settle_on_the_right_totals() {
    init_logger();
    let cache = no_ttl::<String, i32>().build().unwrap();
    let keys: Vec<String> = (0..8).map(|i| format!("k{i}")).collect();
    for key in &keys {
        cache.put(key.clone(), 0);
    }

    let distribution = Bernoulli::new(0.7).unwrap();
    let writes_per_key = Arc::new((0..keys.len()).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());

    let handles: Vec<_> = (0..200)
        .map(|i| {
            let cache = cache.clone();
            let key = keys[i % keys.len()].clone();
            let idx = i % keys.len();
            let writes_per_key = writes_per_key.clone();
            let is_read = distribution.sample(&mut rand::thread_rng());
            thread::spawn(move || {
                if is_read {
                    let _ = cache.get(&key).and_then(|v| v.into_single());
                } else {
                    cache.update::<_, ()>(key, |current| Ok((current.copied().unwrap_or(0) + 1).into())).unwrap();
                    writes_per_key[idx].fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for (idx, key) in keys.iter().enumerate() {
        let expected = writes_per_key[idx].load(Ordering::SeqCst) as i32;
        assert_eq!(cache.get(key).and_then(|v| v.into_single()), Some(expected));
    }
}
