// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end producer/observer scenarios.
//!
//! Each test runs producer and observer in one process against a uniquely
//! named session; the shared-memory path exercised is identical to the
//! cross-process one (separate mappings of the same objects).

use memglass::{
    Atomicity, Config, Guarded, Observer, Primitive, Session, TypeDescriptor, Value,
};
use std::mem::offset_of;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

fn unique_session(tag: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("it_{tag}_{}_{ts}", std::process::id())
}

#[derive(Clone, Copy, Default)]
#[repr(C)]
struct SimpleStruct {
    x: i32,
    y: i32,
    value: f64,
}

fn simple_descriptor() -> TypeDescriptor {
    TypeDescriptor::builder::<SimpleStruct>("SimpleStruct")
        .field(
            "x",
            offset_of!(SimpleStruct, x),
            Primitive::Int32,
            Atomicity::None,
        )
        .field(
            "y",
            offset_of!(SimpleStruct, y),
            Primitive::Int32,
            Atomicity::None,
        )
        .field(
            "value",
            offset_of!(SimpleStruct, value),
            Primitive::Float64,
            Atomicity::None,
        )
        .build()
}

#[derive(Clone, Copy)]
#[repr(C)]
struct ArrayStruct {
    values: [i32; 4],
    name: [u8; 32],
}

fn array_descriptor() -> TypeDescriptor {
    TypeDescriptor::builder::<ArrayStruct>("ArrayStruct")
        .array_field(
            "values",
            offset_of!(ArrayStruct, values),
            Primitive::Int32,
            4,
            Atomicity::None,
        )
        .array_field(
            "name",
            offset_of!(ArrayStruct, name),
            Primitive::Char,
            32,
            Atomicity::None,
        )
        .build()
}

#[test]
fn basic_round_trip() {
    let name = unique_session("basic");
    let session = Session::init(&name, Config::default()).expect("init");
    session.register::<SimpleStruct>(simple_descriptor()).expect("register");

    let mut obj = session.create::<SimpleStruct>("o").expect("create");
    obj.x = 42;
    obj.y = 100;
    obj.value = 3.14159;

    let mut observer = Observer::new(&name);
    observer.connect().expect("connect");

    let view = observer.find("o").expect("find");
    assert_eq!(view.type_name(), "SimpleStruct");
    assert_eq!(view.field("x").read::<i32>(), Some(42));
    assert_eq!(view.field("y").read::<i32>(), Some(100));
    let v = view.field("value").read::<f64>().expect("value");
    assert!((v - 3.14159).abs() < 1e-5);

    // The dynamic path decodes the same bytes.
    assert_eq!(view.field("x").value(), Some(Value::I32(42)));
}

#[test]
fn multiple_objects() {
    let name = unique_session("multi");
    let session = Session::init(&name, Config::default()).expect("init");
    session.register::<SimpleStruct>(simple_descriptor()).expect("register");

    let mut o1 = session.create::<SimpleStruct>("object_1").expect("create");
    let mut o2 = session.create::<SimpleStruct>("object_2").expect("create");
    let mut o3 = session.create::<SimpleStruct>("object_3").expect("create");
    o1.x = 1;
    o2.x = 2;
    o3.x = 3;

    let mut observer = Observer::new(&name);
    observer.connect().expect("connect");

    let objects = observer.objects();
    assert_eq!(objects.len(), 3);
    let mut labels: Vec<&str> = objects.iter().map(|o| o.label.as_str()).collect();
    labels.sort_unstable();
    assert_eq!(labels, ["object_1", "object_2", "object_3"]);

    for (label, expected) in [("object_1", 1), ("object_2", 2), ("object_3", 3)] {
        let view = observer.find(label).expect("find");
        assert_eq!(view.field("x").read::<i32>(), Some(expected));
    }
}

#[test]
fn destruction_hides_object_after_refresh() {
    let name = unique_session("destroy");
    let session = Session::init(&name, Config::default()).expect("init");
    session.register::<SimpleStruct>(simple_descriptor()).expect("register");

    let obj = session.create::<SimpleStruct>("temp").expect("create");

    let mut observer = Observer::new(&name);
    observer.connect().expect("connect");
    assert!(observer.find("temp").is_some());

    session.destroy(obj);
    observer.refresh();

    assert!(observer.find("temp").is_none());
    assert!(observer.objects().iter().all(|o| o.label != "temp"));
}

#[test]
fn array_fields_and_cstr() {
    let name = unique_session("arrays");
    let session = Session::init(&name, Config::default()).expect("init");
    session.register::<ArrayStruct>(array_descriptor()).expect("register");

    let mut obj = session.create::<ArrayStruct>("array_object").expect("create");
    obj.values = [10, 20, 30, 40];
    obj.name[..9].copy_from_slice(b"TestArray");

    let mut observer = Observer::new(&name);
    observer.connect().expect("connect");

    let view = observer.find("array_object").expect("find");
    for (i, expected) in [10, 20, 30, 40].into_iter().enumerate() {
        assert_eq!(view.field("values").index(i).read::<i32>(), Some(expected));
    }
    assert_eq!(view.field("name").read_cstr().as_deref(), Some("TestArray"));

    // Index == array_len resolves to an empty proxy.
    assert!(!view.field("values").index(4).is_valid());
    assert_eq!(view.field("values").index(4).read::<i32>(), None);
}

#[test]
fn growing_regions_are_visible_to_fresh_observer() {
    let name = unique_session("grow");
    let config = Config {
        initial_region_size: 1024 * 1024,
        ..Config::default()
    };
    let session = Session::init(&name, config).expect("init");
    session
        .register::<u8>(
            TypeDescriptor::builder::<u8>("Byte")
                .field("value", 0, Primitive::UInt8, Atomicity::None)
                .build(),
        )
        .expect("register");

    let seq_before = session.sequence();
    let blob = session
        .create_array::<u8>("blob", 2 * 1024 * 1024)
        .expect("2 MiB allocation");
    assert_eq!(blob.len(), 2 * 1024 * 1024);
    assert_eq!(session.region_count(), 2);
    assert!(session.sequence() > seq_before);

    let mut observer = Observer::new(&name);
    observer.connect().expect("connect");
    assert_eq!(observer.region_ids(), vec![1, 2]);
    assert!(observer.find("blob").is_some());
}

#[test]
fn seqlock_reads_stay_consistent_under_contention() {
    #[derive(Clone, Copy, Default)]
    #[repr(C)]
    struct Pair {
        a: u64,
        b: u64,
    }

    // Guarded<T> carries atomics, so the labelled object is created as raw
    // storage of the wrapper's exact shape and written through the wrapper.
    #[derive(Clone, Copy, Default)]
    #[repr(C)]
    struct RawHolder {
        _storage: [u64; 3], // seq word + padding + Pair payload
    }
    assert_eq!(
        std::mem::size_of::<RawHolder>(),
        std::mem::size_of::<Guarded<Pair>>()
    );

    let name = unique_session("seqlock");
    let session = Session::init(&name, Config::default()).expect("init");

    let pair_id = session
        .register_type(
            TypeDescriptor::builder::<Pair>("Pair")
                .field("a", offset_of!(Pair, a), Primitive::UInt64, Atomicity::None)
                .field("b", offset_of!(Pair, b), Primitive::UInt64, Atomicity::None)
                .build(),
        )
        .expect("register pair");

    session
        .register::<RawHolder>(
            TypeDescriptor::builder::<RawHolder>("PairHolder")
                .nested_field("pair", 0, std::mem::size_of::<Pair>(), pair_id, Atomicity::Seqlock)
                .build(),
        )
        .expect("register holder");

    let holder = session.create::<RawHolder>("pair").expect("create");
    // SAFETY: RawHolder has the exact size/alignment of Guarded<Pair> and
    // the zeroed initial bytes are a valid Guarded (seq 0, zero payload).
    let guarded: &Guarded<Pair> = unsafe { &*holder.as_ptr().cast() };

    let stop = Arc::new(AtomicBool::new(false));
    let completed_reads = Arc::new(AtomicU64::new(0));

    let reader = {
        let session_name = name.clone();
        let stop = Arc::clone(&stop);
        let completed_reads = Arc::clone(&completed_reads);
        std::thread::spawn(move || {
            let mut observer = Observer::new(session_name);
            observer.connect().expect("observer connect");
            let view = observer.find("pair").expect("observer find");
            let proxy = view.field("pair");
            while !stop.load(Ordering::Relaxed) {
                if let Some(p) = proxy.try_read::<Pair>() {
                    assert_eq!(p.a, p.b, "torn seqlock read");
                    completed_reads.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    };

    for i in 0..1_000_000u64 {
        guarded.write(Pair { a: i, b: i });
    }
    stop.store(true, Ordering::Relaxed);
    reader.join().expect("reader thread");

    assert!(completed_reads.load(Ordering::Relaxed) > 0);
}

#[test]
fn reconnect_sees_current_state() {
    let name = unique_session("reconnect");
    let session = Session::init(&name, Config::default()).expect("init");
    session.register::<SimpleStruct>(simple_descriptor()).expect("register");

    let first = session.create::<SimpleStruct>("first").expect("create");
    let _second = session.create::<SimpleStruct>("second").expect("create");

    let mut observer = Observer::new(&name);
    observer.connect().expect("connect");
    assert_eq!(observer.objects().len(), 2);
    observer.disconnect();
    assert!(!observer.is_connected());

    session.destroy(first);

    observer.connect().expect("reconnect");
    let objects = observer.objects();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].label, "second");
}

#[test]
fn dotted_names_resolve_through_nested_types() {
    #[derive(Clone, Copy, Default)]
    #[repr(C)]
    struct Inner {
        bid: f64,
        ask: f64,
    }

    #[derive(Clone, Copy, Default)]
    #[repr(C)]
    struct Outer {
        id: u32,
        _pad: u32,
        quote: Inner,
    }

    let name = unique_session("dotted");
    let session = Session::init(&name, Config::default()).expect("init");

    let inner_id = session
        .register::<Inner>(
            TypeDescriptor::builder::<Inner>("Inner")
                .field("bid", offset_of!(Inner, bid), Primitive::Float64, Atomicity::None)
                .field("ask", offset_of!(Inner, ask), Primitive::Float64, Atomicity::None)
                .build(),
        )
        .expect("register inner");

    session
        .register::<Outer>(
            TypeDescriptor::builder::<Outer>("Outer")
                .field("id", offset_of!(Outer, id), Primitive::UInt32, Atomicity::None)
                .nested_field(
                    "quote",
                    offset_of!(Outer, quote),
                    std::mem::size_of::<Inner>(),
                    inner_id,
                    Atomicity::None,
                )
                // Pre-flattened alias: exact match must win over recursion.
                .field(
                    "quote.bid",
                    offset_of!(Outer, quote) + offset_of!(Inner, bid),
                    Primitive::Float64,
                    Atomicity::None,
                )
                .build(),
        )
        .expect("register outer");

    let mut obj = session.create::<Outer>("market").expect("create");
    obj.id = 9;
    obj.quote.bid = 101.5;
    obj.quote.ask = 102.0;

    let mut observer = Observer::new(&name);
    observer.connect().expect("connect");
    let view = observer.find("market").expect("find");

    // Pre-flattened exact match.
    assert_eq!(view.field("quote.bid").read::<f64>(), Some(101.5));
    // Recursive resolution for a name with no flat alias.
    assert_eq!(view.field("quote.ask").read::<f64>(), Some(102.0));
    // Nested hop by hand.
    assert_eq!(view.field("quote").field("ask").read::<f64>(), Some(102.0));

    // A dotted name whose prefix is not a nested field is empty.
    assert!(!view.field("id.bid").is_valid());
    assert!(!view.field("missing.ask").is_valid());
}

#[test]
fn connect_to_missing_session_fails_cleanly() {
    let mut observer = Observer::new(unique_session("missing"));
    assert!(observer.connect().is_err());
    assert!(!observer.is_connected());
    assert!(observer.find("anything").is_none());
    assert!(observer.objects().is_empty());
}

#[test]
fn observer_survives_producer_shutdown() {
    let name = unique_session("shutdown");
    let session = Session::init(&name, Config::default()).expect("init");
    session.register::<SimpleStruct>(simple_descriptor()).expect("register");
    let mut obj = session.create::<SimpleStruct>("o").expect("create");
    obj.x = 7;

    let mut observer = Observer::new(&name);
    observer.connect().expect("connect");
    let before = observer.find("o").expect("find").field("x").read::<i32>();
    assert_eq!(before, Some(7));

    // Producer shuts down: names unlink, mappings survive.
    session.shutdown();

    let view = observer.find("o").expect("still mapped");
    assert_eq!(view.field("x").read::<i32>(), Some(7));

    // A fresh observer cannot attach anymore.
    let mut late = Observer::new(&name);
    assert!(late.connect().is_err());
}

#[test]
fn refresh_is_driven_by_the_structural_sequence() {
    let name = unique_session("refresh");
    let session = Session::init(&name, Config::default()).expect("init");
    session.register::<SimpleStruct>(simple_descriptor()).expect("register");

    let mut observer = Observer::new(&name);
    observer.connect().expect("connect");
    assert!(observer.objects().is_empty());
    let seq_connect = observer.sequence();

    let _obj = session.create::<SimpleStruct>("late").expect("create");
    assert!(observer.sequence() > seq_connect);

    observer.refresh();
    assert_eq!(observer.objects().len(), 1);
    assert!(observer.find("late").is_some());
}
