//! Integration tests: the zero-copy send pipeline and completion delivery
//! over the in-process software device.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use txlane::{
    CompletionEvent, Config, ConfigBuilder, Driver, DriverBuilder, Error, MemoryRegion, PollMode,
    SendFlags, SocketToken, SoftAccelerator,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn build(accel: Arc<SoftAccelerator>) -> Driver {
    DriverBuilder::new(Config::default()).build(accel).unwrap()
}

/// Listener on `addr` plus a connected client socket.
fn connected_pair(driver: &Driver, addr: &str) -> (SocketToken, SocketToken) {
    let addr = addr.parse().unwrap();
    let listener = driver.socket().unwrap();
    driver.bind(listener, addr).unwrap();
    driver.listen(listener).unwrap();

    let client = driver.socket().unwrap();
    driver.connect(client, addr).unwrap();
    (client, listener)
}

fn register(driver: &Driver, backing: &mut [u8]) -> txlane::RegionKey {
    driver
        .register(MemoryRegion {
            ptr: backing.as_mut_ptr(),
            len: backing.len(),
        })
        .unwrap()
}

// ── Tests ───────────────────────────────────────────────────────────

/// The canonical batch scenario: a held header, a held payload, one flush.
/// Exactly two events, header first, none before the flush.
#[test]
fn header_then_payload_batch_completes_after_flush() {
    let accel = Arc::new(SoftAccelerator::new());
    let driver = build(accel.clone());
    let (client, _listener) = connected_pair(&driver, "10.0.0.1:8080");
    driver.set_userdata(client, 0xdeadc0de).unwrap();

    let mut backing = vec![0u8; 4096];
    backing[..12].copy_from_slice(b"hello world\n");
    backing[12..44].fill(b'a');
    let key = register(&driver, &mut backing);

    driver.send(client, key, 0, 12, SendFlags::MORE, 0).unwrap();
    driver
        .send(client, key, 12, 32, SendFlags::MORE, 0xdeadbeef)
        .unwrap();

    let ring = driver.rings_for(client).unwrap()[0];
    assert!(
        driver
            .poll_completions(ring, PollMode::NonBlocking)
            .unwrap()
            .is_empty(),
        "no completion may arrive before flush"
    );

    driver.flush(client).unwrap();

    let events = driver
        .poll_completions(ring, PollMode::Blocking(Duration::from_secs(1)))
        .unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].tag, 0);
    assert_eq!(events[0].len, 12);
    assert_eq!(events[1].tag, 0xdeadbeef);
    assert_eq!(events[1].len, 32);
    for event in &events {
        assert_eq!(event.socket, client);
        assert_eq!(event.socket_userdata, 0xdeadc0de);
    }

    // The coalesced batch went out as one logically-ordered byte stream.
    let hw = driver.transport_handle(client).unwrap();
    let wire = accel.transmitted(hw);
    assert_eq!(&wire[..12], b"hello world\n");
    assert!(wire[12..44].iter().all(|&b| b == b'a'));
    assert_eq!(wire.len(), 44);

    driver.close(client).unwrap();
    driver.deregister(key).unwrap();
}

/// Every submitted-and-flushed send yields exactly one event, in
/// submission order, under a mix of held and immediate sends.
#[test]
fn completions_exactly_once_in_submission_order() {
    let driver = build(Arc::new(SoftAccelerator::new()));
    let (client, _listener) = connected_pair(&driver, "10.0.0.2:8080");

    let mut backing = vec![0u8; 1024];
    let key = register(&driver, &mut backing);

    for tag in 0..32u64 {
        let flags = if tag % 3 == 0 {
            SendFlags::MORE
        } else {
            SendFlags::NONE
        };
        driver.send(client, key, tag as usize, 1, flags, tag).unwrap();
    }
    driver.flush(client).unwrap();
    // A second flush is an idempotent no-op.
    driver.flush(client).unwrap();

    let ring = driver.rings_for(client).unwrap()[0];
    let events = driver
        .poll_completions(ring, PollMode::Blocking(Duration::from_secs(1)))
        .unwrap();
    let tags: Vec<u64> = events.iter().map(|e| e.tag).collect();
    assert_eq!(tags, (0..32u64).collect::<Vec<_>>());

    assert!(
        driver
            .poll_completions(ring, PollMode::NonBlocking)
            .unwrap()
            .is_empty(),
        "no duplicate events"
    );
}

#[test]
fn blocking_poll_times_out_empty() {
    let driver = build(Arc::new(SoftAccelerator::new()));
    let (client, _listener) = connected_pair(&driver, "10.0.0.3:8080");
    let ring = driver.rings_for(client).unwrap()[0];

    let start = std::time::Instant::now();
    let events = driver
        .poll_completions(ring, PollMode::Blocking(Duration::from_millis(50)))
        .unwrap();
    assert!(events.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(50));
}

/// Dispatch mode: the handler runs on a completion thread, never on the
/// submitting thread, and polling is unavailable.
#[test]
fn dispatch_mode_delivers_off_the_submitting_thread() {
    let seen: Arc<Mutex<Vec<(thread::ThreadId, CompletionEvent)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = seen.clone();

    let driver = DriverBuilder::new(Config::default())
        .send_complete_handler(move |event: CompletionEvent| {
            seen_in_handler
                .lock()
                .unwrap()
                .push((thread::current().id(), event));
        })
        .build(Arc::new(SoftAccelerator::new()))
        .unwrap();

    let (client, _listener) = connected_pair(&driver, "10.0.0.4:8080");
    let mut backing = vec![0u8; 64];
    let key = register(&driver, &mut backing);

    driver.send(client, key, 0, 8, SendFlags::NONE, 7).unwrap();
    driver.send(client, key, 8, 8, SendFlags::NONE, 8).unwrap();

    let submitter = thread::current().id();
    for _ in 0..200 {
        if seen.lock().unwrap().len() == 2 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].1.tag, 7);
    assert_eq!(seen[1].1.tag, 8);
    for (tid, _) in seen.iter() {
        assert_ne!(*tid, submitter, "handler ran on the submitting thread");
    }

    let ring = driver.rings_for(client).unwrap()[0];
    assert!(matches!(
        driver.poll_completions(ring, PollMode::NonBlocking),
        Err(Error::PollUnavailable)
    ));
}

/// A full transmit queue refuses the send without side effects; after the
/// device drains, the retry succeeds and every posted send completes once.
#[test]
fn backpressure_would_block_then_retry() {
    let accel = Arc::new(SoftAccelerator::manual());
    let config = ConfigBuilder::new().tx_queue_depth(2).build().unwrap();
    let driver = DriverBuilder::new(config).build(accel.clone()).unwrap();
    let (client, _listener) = connected_pair(&driver, "10.0.0.5:8080");

    let mut backing = vec![0u8; 64];
    let key = register(&driver, &mut backing);

    driver.send(client, key, 0, 4, SendFlags::NONE, 1).unwrap();
    driver.send(client, key, 4, 4, SendFlags::NONE, 2).unwrap();
    assert!(matches!(
        driver.send(client, key, 8, 4, SendFlags::NONE, 3),
        Err(Error::WouldBlock)
    ));

    let ring = driver.rings_for(client).unwrap()[0];
    assert_eq!(accel.pump_all(), 2);

    // Queue space is back: the retry goes through.
    driver.send(client, key, 8, 4, SendFlags::NONE, 3).unwrap();
    accel.pump(ring, usize::MAX);

    let events = driver
        .poll_completions(ring, PollMode::Blocking(Duration::from_secs(1)))
        .unwrap();
    let tags: Vec<u64> = events.iter().map(|e| e.tag).collect();
    assert_eq!(tags, vec![1, 2, 3]);
}

/// Deregistration is refused while a posted send has not completed, and
/// succeeds right after the last referencing completion.
#[test]
fn region_busy_until_last_completion() {
    let accel = Arc::new(SoftAccelerator::manual());
    let driver = DriverBuilder::new(Config::default())
        .build(accel.clone())
        .unwrap();
    let (client, _listener) = connected_pair(&driver, "10.0.0.6:8080");

    let mut backing = vec![0u8; 64];
    let key = register(&driver, &mut backing);

    driver.send(client, key, 0, 16, SendFlags::NONE, 1).unwrap();
    assert!(matches!(driver.deregister(key), Err(Error::RegionBusy)));

    accel.pump_all();
    driver.deregister(key).unwrap();
}

/// A batch-held send also pins its region; discarding it on close releases
/// the pin without fabricating a completion event.
#[test]
fn held_send_blocks_deregister_until_close() {
    let driver = build(Arc::new(SoftAccelerator::new()));
    let (client, _listener) = connected_pair(&driver, "10.0.0.7:8080");

    let mut backing = vec![0u8; 64];
    let key = register(&driver, &mut backing);
    let ring = driver.rings_for(client).unwrap()[0];

    driver.send(client, key, 0, 16, SendFlags::MORE, 42).unwrap();
    assert!(matches!(driver.deregister(key), Err(Error::RegionBusy)));

    driver.close(client).unwrap();
    driver.deregister(key).unwrap();

    // The held send was never flushed, so it never completed.
    let events = driver.poll_completions(ring, PollMode::NonBlocking).unwrap();
    assert!(events.is_empty());
}

#[test]
fn out_of_range_and_stale_keys_fail() {
    let driver = build(Arc::new(SoftAccelerator::new()));
    let (client, _listener) = connected_pair(&driver, "10.0.0.8:8080");

    let mut backing = vec![0u8; 64];
    let key = register(&driver, &mut backing);

    // In-range succeeds; anything past the region fails.
    driver.send(client, key, 32, 32, SendFlags::NONE, 0).unwrap();
    assert!(matches!(
        driver.send(client, key, 32, 33, SendFlags::NONE, 0),
        Err(Error::InvalidKey)
    ));
    assert!(matches!(
        driver.send(client, key, 64, 1, SendFlags::NONE, 0),
        Err(Error::InvalidKey)
    ));
    assert!(matches!(
        driver.send(client, key, 0, 0, SendFlags::NONE, 0),
        Err(Error::InvalidKey)
    ));

    driver.deregister(key).unwrap();
    assert!(matches!(
        driver.send(client, key, 0, 8, SendFlags::NONE, 0),
        Err(Error::InvalidKey)
    ));
    assert!(matches!(driver.deregister(key), Err(Error::InvalidKey)));
}

/// Sends in flight when their socket closes still deliver their events,
/// exactly once, through the retired ring queue.
#[test]
fn completions_survive_socket_close() {
    let accel = Arc::new(SoftAccelerator::manual());
    let driver = DriverBuilder::new(Config::default())
        .build(accel.clone())
        .unwrap();
    let (client, _listener) = connected_pair(&driver, "10.0.0.9:8080");

    let mut backing = vec![0u8; 64];
    let key = register(&driver, &mut backing);
    let ring = driver.rings_for(client).unwrap()[0];

    driver.send(client, key, 0, 8, SendFlags::NONE, 77).unwrap();

    // Closing the last member retires the ring; teardown quiesces the
    // queued send, which must still complete.
    driver.close(client).unwrap();

    let events = driver
        .poll_completions(ring, PollMode::Blocking(Duration::from_secs(1)))
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tag, 77);
    assert_eq!(events[0].socket, client);

    driver.deregister(key).unwrap();

    // Fully drained and disconnected: the retired queue is gone.
    assert!(matches!(
        driver.poll_completions(ring, PollMode::NonBlocking),
        Err(Error::InvalidState)
    ));
}

/// The per-socket hold bound is enforced rather than buffering unboundedly.
#[test]
fn hold_queue_bound_surfaces_would_block() {
    let config = ConfigBuilder::new().max_held_sends(2).build().unwrap();
    let driver = DriverBuilder::new(config)
        .build(Arc::new(SoftAccelerator::new()))
        .unwrap();
    let (client, _listener) = connected_pair(&driver, "10.0.0.10:8080");

    let mut backing = vec![0u8; 64];
    let key = register(&driver, &mut backing);

    driver.send(client, key, 0, 4, SendFlags::MORE, 1).unwrap();
    driver.send(client, key, 4, 4, SendFlags::MORE, 2).unwrap();
    assert!(matches!(
        driver.send(client, key, 8, 4, SendFlags::MORE, 3),
        Err(Error::WouldBlock)
    ));

    // Flushing drains the stage; the retry then fits.
    driver.flush(client).unwrap();
    driver.send(client, key, 8, 4, SendFlags::MORE, 3).unwrap();
}
