//! End-to-end tests for status words and listener delivery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mapper_rs::{DataType, Device, Direction, Engine, GraphObject, Map, ObjectKind, Signal, Status};
use pretty_assertions::assert_eq;

// ============================================================================
// Helpers
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn poll_until(devices: &[&Device], mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if done() {
            return true;
        }
        for device in devices {
            device.poll(10);
        }
    }
    done()
}

/// Two ready devices with an established `out -> in` map of int32 scalars.
fn mapped_pair(engine: &Engine) -> (Device, Device, Signal, Signal, Map) {
    let src = Device::new("source", engine).unwrap();
    let dst = Device::new("destination", engine).unwrap();
    let out = src.add_signal(Direction::Outgoing, "out", 1, DataType::Int32).unwrap();
    let inp = dst.add_signal(Direction::Incoming, "in", 1, DataType::Int32).unwrap();
    assert!(poll_until(&[&src, &dst], || {
        src.ready() && dst.ready() && src.graph().signals(Direction::Any).len() == 2
    }));
    let map = Map::new(&[&out], &[&inp]).unwrap();
    assert!(poll_until(&[&src, &dst], || map.ready()));
    (src, dst, out, inp, map)
}

// ============================================================================
// 1. Value presence
// ============================================================================

#[test]
fn test_zero_is_a_value() {
    init_tracing();
    let engine = Engine::loopback_default();
    let (_src, dst, out, inp, _map) = mapped_pair(&engine);
    assert!(!inp.has_value());
    assert!(!inp.status(false).contains(Status::HAS_VALUE));

    out.set_value(0).unwrap();
    assert!(poll_until(&[&dst], || inp.has_value()));
    assert_eq!(inp.value_as::<i32>().unwrap(), Some(vec![0]));
    assert!(inp.status(false).contains(Status::HAS_VALUE));
}

// ============================================================================
// 2. Volatile bits clear once
// ============================================================================

#[test]
fn test_remote_update_bits_clear_once() {
    init_tracing();
    let engine = Engine::loopback_default();
    let (_src, dst, out, inp, _map) = mapped_pair(&engine);

    out.set_value(5).unwrap();
    assert!(poll_until(&[&dst], || inp.has_value()));

    let first = inp.status(true);
    assert!(first.contains(Status::REMOTE_UPDATE | Status::NEW_VALUE));
    let second = inp.status(true);
    assert!(!second.intersects(Status::REMOTE_UPDATE | Status::NEW_VALUE));
    assert!(second.contains(Status::ACTIVE | Status::HAS_VALUE));
    assert_eq!(inp.status(true), second);
}

#[test]
fn test_device_becomes_active_on_registration() {
    init_tracing();
    let engine = Engine::loopback_default();
    let dev = Device::new("fresh", &engine).unwrap();
    let status = dev.status(false);
    assert!(status.contains(Status::NEW | Status::STAGED));
    assert!(!status.contains(Status::ACTIVE));

    assert!(poll_until(&[&dev], || dev.ready()));
    let status = dev.status(true);
    assert!(status.contains(Status::ACTIVE | Status::MODIFIED));
    assert!(!status.contains(Status::STAGED));
    assert!(!dev.status(false).contains(Status::MODIFIED));
}

// ============================================================================
// 3. Listeners
// ============================================================================

#[test]
fn test_default_listener_hears_remote_updates_only() {
    init_tracing();
    let engine = Engine::loopback_default();
    let (_src, dst, out, inp, _map) = mapped_pair(&engine);
    let heard = Arc::new(Mutex::new(Vec::new()));
    let sink = heard.clone();
    let listener = inp.add_listener(move |event| sink.lock().unwrap().push(event.status));

    inp.set_value(9).unwrap();
    dst.poll(0);
    assert!(heard.lock().unwrap().is_empty());

    out.set_value(1).unwrap();
    assert!(poll_until(&[&dst], || !heard.lock().unwrap().is_empty()));
    assert_eq!(*heard.lock().unwrap(), vec![Status::REMOTE_UPDATE]);

    assert!(inp.remove_listener(listener));
    out.set_value(2).unwrap();
    assert!(poll_until(&[&dst], || inp.value_as::<i32>().unwrap() == Some(vec![2])));
    assert_eq!(heard.lock().unwrap().len(), 1);
}

#[test]
fn test_callback_events_wait_for_next_poll() {
    init_tracing();
    let engine = Engine::loopback_default();
    let (_src, dst, out, inp, _map) = mapped_pair(&engine);
    let echo = dst.add_signal(Direction::Outgoing, "echo", 1, DataType::Int32).unwrap();

    let echoed = Arc::new(AtomicUsize::new(0));
    let counter = echoed.clone();
    echo.add_listener_for(Status::LOCAL_UPDATE, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let target = echo.clone();
    inp.add_listener(move |event| {
        if let Some(value) = &event.value {
            target.set_value(value.clone()).unwrap();
        }
    });

    out.set_value(4).unwrap();
    assert!(poll_until(&[&dst], || echo.has_value()));
    assert_eq!(echoed.load(Ordering::SeqCst), 0);

    dst.poll(0);
    assert_eq!(echoed.load(Ordering::SeqCst), 1);
    assert_eq!(echo.value_as::<i32>().unwrap(), Some(vec![4]));
}

#[test]
fn test_poll_from_object_listener_is_refused() {
    init_tracing();
    let engine = Engine::loopback_default();
    let (_src, dst, out, inp, _map) = mapped_pair(&engine);
    let inner = Arc::new(AtomicUsize::new(usize::MAX));
    let sink = inner.clone();
    let nested = dst.clone();
    inp.add_listener(move |_| {
        sink.store(nested.poll(0), Ordering::SeqCst);
    });

    out.set_value(3).unwrap();
    assert!(poll_until(&[&dst], || inp.has_value()));
    assert_eq!(inner.load(Ordering::SeqCst), 0);
}

// ============================================================================
// 4. Removal and expiry
// ============================================================================

#[test]
fn test_freed_remote_device_reads_removed() {
    init_tracing();
    let engine = Engine::loopback_default();
    let (src, dst, _out, _inp, map) = mapped_pair(&engine);
    let remote = dst
        .graph()
        .devices()
        .iter()
        .find(|d| !d.is_local())
        .unwrap();
    let remote_map = dst.graph().maps().get(0).unwrap();

    src.free().unwrap();
    assert!(poll_until(&[&dst], || !remote.is_valid()));
    assert!(remote.status(false).contains(Status::REMOVED));
    assert!(remote_map.status(false).contains(Status::REMOVED));
    assert!(!map.is_valid());
    assert_eq!(remote.name(), None);
}

#[test]
fn test_dropped_remote_device_reads_expired() {
    init_tracing();
    let engine = Engine::loopback_default();
    let watcher = Device::new("watcher", &engine).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    watcher.graph().add_listener(ObjectKind::Signal, Status::NEW | Status::EXPIRED, move |event| {
        sink.lock().unwrap().push(event.status);
    });

    let remote = {
        let gone = Device::new("ephemeral", &engine).unwrap();
        gone.add_signal(Direction::Outgoing, "out", 1, DataType::Float32).unwrap();
        assert!(poll_until(&[&gone, &watcher], || {
            watcher.graph().signals(Direction::Any).len() == 1
        }));
        watcher.graph().devices().iter().find(|d| !d.is_local()).unwrap()
    };

    assert!(poll_until(&[&watcher], || !remote.is_valid()));
    assert!(remote.status(false).contains(Status::EXPIRED));
    assert!(!remote.status(false).contains(Status::REMOVED));
    assert_eq!(*seen.lock().unwrap(), vec![Status::NEW, Status::EXPIRED]);
}
