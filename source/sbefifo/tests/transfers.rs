use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use sbefifo::{sim::SimSbe, BusError, Device, Error, Mode, SbefifoSettings, Tick};

fn trace_init() {
    use tracing_subscriber::filter::{EnvFilter, LevelFilter};

    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    let filter = if env.is_empty() {
        builder.parse("sbefifo=debug").unwrap()
    } else {
        builder.parse_lossy(env)
    };

    let _res = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_thread_names(true)
        .without_time()
        .try_init();
}

fn words(ws: &[u32]) -> Vec<u8> {
    ws.iter().flat_map(|w| w.to_ne_bytes()).collect()
}

fn unwords(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn fast() -> SbefifoSettings {
    SbefifoSettings::default()
        .with_poll_interval(Duration::from_millis(1))
        .with_max_data_wait(Duration::from_secs(2))
}

/// Reads one whole response of `len` bytes.
fn read_exact(client: &sbefifo::Client, len: usize) -> Result<Vec<u8>, Error> {
    let mut out = vec![0; len];
    let mut got = 0;
    while got < len {
        let n = client.read(&mut out[got..])?;
        assert_ne!(n, 0, "response ended early");
        got += n;
    }
    Ok(out)
}

////////////////////////////////////////////////////////////////////////////////
// Hand-ticked
////////////////////////////////////////////////////////////////////////////////

#[test]
fn round_trip() {
    trace_init();
    let sim = SimSbe::new();
    let (dev, mut poller) = Device::attach(sim.clone(), SbefifoSettings::default()).unwrap();
    let client = dev.open(Mode::Blocking).unwrap();

    let req = words(&[0xa1, 0xb2, 0xc3]);
    assert_eq!(client.write(&req), Ok(12));
    assert_eq!(dev.queued_transfers(), 1);
    assert_eq!(poller.tick(), Tick::Idle);

    let mut buf = [0u8; 64];
    assert_eq!(client.read(&mut buf), Ok(12));
    assert_eq!(&buf[..12], &req[..]);

    let stats = sim.stats();
    assert_eq!(stats.eot_raised, 1);
    assert_eq!(stats.eot_acked, 1);
    assert_eq!(dev.queued_transfers(), 0);
}

#[test]
fn backpressure_drains_in_two_ticks() {
    trace_init();
    let settings = SbefifoSettings::default();
    let sim = SimSbe::new().with_upstream_slots(4);
    let (dev, mut poller) = Device::attach(sim.clone(), settings).unwrap();
    let client = dev.open(Mode::Blocking).unwrap();

    let req: Vec<u32> = (100..108).collect();
    client.write(&words(&req)).unwrap();

    assert_eq!(poller.tick(), Tick::Reschedule(settings.poll_interval()));
    assert_eq!(sim.stats().words_up, 4);
    assert_eq!(sim.stats().eot_raised, 0);

    assert_eq!(poller.tick(), Tick::Idle);
    assert_eq!(sim.stats().words_up, 8);
    assert_eq!(sim.stats().eot_raised, 1);
    assert_eq!(sim.requests(), vec![req.clone()]);

    let out = read_exact(&client, 32).unwrap();
    assert_eq!(unwords(&out), req);
}

#[test]
fn clients_are_served_in_submission_order() {
    trace_init();
    let sim = SimSbe::new();
    let (dev, mut poller) = Device::attach(sim.clone(), SbefifoSettings::default()).unwrap();
    let a = dev.open(Mode::Blocking).unwrap();
    let b = dev.open(Mode::Blocking).unwrap();

    a.write(&words(&[1])).unwrap();
    b.write(&words(&[2])).unwrap();
    assert_eq!(dev.queued_transfers(), 2);

    // A finishes first, and B is ready to go right behind it
    assert_eq!(poller.tick(), Tick::Again);
    assert_eq!(sim.requests(), vec![vec![1]]);
    assert!(a.readiness().is_readable());
    assert!(!b.readiness().is_readable());

    assert_eq!(poller.tick(), Tick::Idle);
    assert_eq!(sim.requests(), vec![vec![1], vec![2]]);

    let mut buf = [0u8; 4];
    assert_eq!(b.read(&mut buf), Ok(4));
    assert_eq!(unwords(&buf), vec![2]);
    assert_eq!(a.read(&mut buf), Ok(4));
    assert_eq!(unwords(&buf), vec![1]);
}

#[test]
fn dropped_client_is_drained_against_scratch() {
    trace_init();
    let sim = SimSbe::new().with_upstream_slots(4);
    let (dev, mut poller) = Device::attach(sim.clone(), SbefifoSettings::default()).unwrap();
    let a = dev.open(Mode::Blocking).unwrap();
    let b = dev.open(Mode::Blocking).unwrap();
    let c = dev.open(Mode::Blocking).unwrap();

    a.write(&words(&[1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
    assert!(matches!(poller.tick(), Tick::Reschedule(_)));
    b.write(&words(&[9])).unwrap();
    c.write(&words(&[10])).unwrap();

    // A is halfway onto the device, B has not been touched yet
    drop(a);
    drop(b);
    assert_eq!(dev.queued_transfers(), 2);

    // A's round trip is finished with what had already gone out
    assert_eq!(poller.tick(), Tick::Again);
    assert_eq!(sim.requests(), vec![vec![1, 2, 3, 4]]);
    assert_eq!(sim.downstream_len(), 0);

    assert_eq!(poller.tick(), Tick::Idle);
    assert_eq!(sim.requests(), vec![vec![1, 2, 3, 4], vec![10]]);

    let mut buf = [0u8; 64];
    assert_eq!(c.read(&mut buf), Ok(4));
    assert_eq!(unwords(&buf[..4]), vec![10]);
    assert_eq!(dev.queued_transfers(), 0);
}

#[test]
fn dropped_reader_is_drained_against_scratch() {
    trace_init();
    let sim = SimSbe::new().with_responder(|req| Some((0..40).map(|w| w + req[0]).collect()));
    let (dev, mut poller) = Device::attach(sim.clone(), SbefifoSettings::default()).unwrap();
    let a = dev.open(Mode::Blocking).unwrap();
    let b = dev.open(Mode::Blocking).unwrap();
    a.write(&words(&[100])).unwrap();
    b.write(&words(&[200])).unwrap();

    // A's read ring is full, the rest of its response is still in the device
    assert_eq!(poller.tick(), Tick::Idle);
    assert_eq!(sim.downstream_len(), 9);
    assert!(a.readiness().is_readable());

    drop(a);
    assert_eq!(poller.tick(), Tick::Again);
    assert_eq!(sim.downstream_len(), 0);
    assert_eq!(sim.stats().eot_acked, 1);
    assert_eq!(dev.queued_transfers(), 1);

    assert_eq!(poller.tick(), Tick::Idle);
    assert_eq!(sim.requests(), vec![vec![100], vec![200]]);
    let mut buf = [0u8; 8];
    assert_eq!(b.read(&mut buf), Ok(8));
    assert_eq!(unwords(&buf), vec![200, 201]);
}

#[test]
fn bus_error_fails_a_blocked_writer() {
    trace_init();
    let sim = SimSbe::new();
    let (dev, mut poller) = Device::attach(sim.clone(), SbefifoSettings::default()).unwrap();
    let client = dev.open(Mode::Blocking).unwrap();
    let req = words(&(0..48).collect::<Vec<u32>>());

    thread::scope(|s| {
        let writer = s.spawn(|| client.write(&req));
        // the first chunk fills the write ring, then the writer waits
        while client.readiness().is_writable() {
            thread::yield_now();
        }
        sim.fail_after(0, BusError::MasterTimeout);
        assert_eq!(poller.tick(), Tick::Idle);
        assert_eq!(
            writer.join().unwrap(),
            Err(Error::Bus(BusError::MasterTimeout))
        );
    });
    assert_eq!(dev.queued_transfers(), 0);
    assert_eq!(sim.stats().words_up, 0);
}

#[test]
fn bus_error_is_latched_everywhere() {
    trace_init();
    let sim = SimSbe::new();
    let (dev, mut poller) = Device::attach(sim.clone(), SbefifoSettings::default()).unwrap();
    let a = dev.open(Mode::Blocking).unwrap();
    let b = dev.open(Mode::NonBlocking).unwrap();

    a.write(&words(&[1, 2])).unwrap();
    b.write(&words(&[3])).unwrap();
    sim.fail_after(0, BusError::MasterCrc);

    assert_eq!(poller.tick(), Tick::Idle);
    let err = Error::Bus(BusError::MasterCrc);
    assert_eq!(dev.fatal_error(), Some(err.clone()));
    assert_eq!(dev.queued_transfers(), 0);

    let mut buf = [0u8; 8];
    assert_eq!(a.write(&words(&[4])), Err(err.clone()));
    assert_eq!(a.read(&mut buf), Err(err.clone()));
    assert_eq!(b.read(&mut buf), Err(err.clone()));
    assert!(b.readiness().is_error());
    assert_eq!(dev.open(Mode::Blocking).err(), Some(err.clone()));

    // later ticks leave the device alone
    let before = sim.stats();
    assert_eq!(poller.tick(), Tick::Idle);
    assert_eq!(sim.stats(), before);
}

#[test]
fn long_response_is_paced_by_the_reader() {
    trace_init();
    let sim = SimSbe::new().with_responder(|_| Some((0..36).collect()));
    let (dev, mut poller) = Device::attach(sim.clone(), SbefifoSettings::default()).unwrap();
    let client = dev.open(Mode::Blocking).unwrap();
    client.write(&words(&[0])).unwrap();

    // the read ring fills up, and the poller waits for the reader
    assert_eq!(poller.tick(), Tick::Idle);
    assert_eq!(sim.downstream_len(), 5);

    let mut out = Vec::new();
    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf), Ok(8));
    out.extend_from_slice(&buf);

    // two slots free: the marker behind four data words has to stay put
    assert_eq!(poller.tick(), Tick::Idle);
    assert_eq!(sim.downstream_len(), 3);
    assert_eq!(sim.stats().eot_acked, 0);

    let mut buf = [0u8; 256];
    assert_eq!(client.read(&mut buf), Ok(128));
    out.extend_from_slice(&buf[..128]);

    assert_eq!(poller.tick(), Tick::Idle);
    assert_eq!(sim.stats().eot_acked, 1);
    assert_eq!(client.read(&mut buf), Ok(8));
    out.extend_from_slice(&buf[..8]);

    assert_eq!(unwords(&out), (0..36).collect::<Vec<u32>>());
    assert_eq!(dev.queued_transfers(), 0);
}

#[test]
fn empty_response_reads_as_zero() {
    trace_init();
    let sim = SimSbe::new().with_responder(|_| Some(Vec::new()));
    let (dev, mut poller) = Device::attach(sim, SbefifoSettings::default()).unwrap();
    let client = dev.open(Mode::NonBlocking).unwrap();
    client.write(&words(&[5])).unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(client.read(&mut buf), Err(Error::WouldBlock));
    poller.tick();
    assert_eq!(client.read(&mut buf), Ok(0));
    assert_eq!(client.write(&words(&[6])), Ok(4));
}

#[test]
fn nonblocking_write_behind_another_client() {
    trace_init();
    let (dev, _poller) = Device::attach(SimSbe::new(), SbefifoSettings::default()).unwrap();
    let a = dev.open(Mode::Blocking).unwrap();
    let b = dev.open(Mode::NonBlocking).unwrap();

    a.write(&words(&[1])).unwrap();
    let big = vec![0u8; sbefifo::BUF_BYTES + 4];
    assert_eq!(b.write(&big), Err(Error::WouldBlock));
    assert_eq!(dev.queued_transfers(), 1);

    // a request that fits still queues up behind A
    assert_eq!(b.write(&words(&[2])), Ok(4));
    assert_eq!(dev.queued_transfers(), 2);
}

#[test]
fn data_timeout_then_stuck_reset_is_fatal() {
    trace_init();
    let settings = SbefifoSettings::default()
        .with_max_data_wait(Duration::ZERO)
        .with_reset_timeout(Duration::ZERO);
    let sim = SimSbe::new().silent().with_stuck_reset();
    let (dev, mut poller) = Device::attach(sim.clone(), settings).unwrap();
    let client = dev.open(Mode::Blocking).unwrap();

    client.write(&words(&[1])).unwrap();
    assert_eq!(poller.tick(), Tick::Reschedule(settings.reset_poll()));
    assert_eq!(sim.stats().resets, 1);

    let mut buf = [0u8; 4];
    assert_eq!(client.read(&mut buf), Err(Error::Timeout));
    assert_eq!(dev.fatal_error(), None);

    assert_eq!(poller.tick(), Tick::Idle);
    assert_eq!(dev.fatal_error(), Some(Error::ResetTimeout));
    assert_eq!(client.write(&words(&[2])), Err(Error::ResetTimeout));
}

////////////////////////////////////////////////////////////////////////////////
// With a poller thread
////////////////////////////////////////////////////////////////////////////////

#[test]
fn blocking_read_waits_for_a_request() {
    trace_init();
    let dev = Device::spawn(SimSbe::new(), fast()).unwrap();
    let client = Arc::new(dev.open(Mode::Blocking).unwrap());

    let (tx, rx) = mpsc::channel();
    let reader = {
        let client = client.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 8];
            let res = client.read(&mut buf).map(|n| buf[..n].to_vec());
            tx.send(res).unwrap();
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    client.write(&words(&[42])).unwrap();
    let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got, Ok(words(&[42])));
    reader.join().unwrap();
}

#[test]
fn request_larger_than_the_rings() {
    trace_init();
    let dev = Device::spawn(SimSbe::new(), fast()).unwrap();
    let client = dev.open(Mode::Blocking).unwrap();

    let req: Vec<u32> = (0..100).map(|i| i * 3).collect();
    assert_eq!(client.write(&words(&req)), Ok(400));
    let out = read_exact(&client, 400).unwrap();
    assert_eq!(unwords(&out), req);
}

#[test]
fn data_timeout_is_bounded_and_recoverable() {
    trace_init();
    let sim = SimSbe::new().silent();
    let settings = fast().with_max_data_wait(Duration::from_millis(50));
    let dev = Device::spawn(sim.clone(), settings).unwrap();
    let client = dev.open(Mode::Blocking).unwrap();

    client.write(&words(&[1])).unwrap();
    let start = Instant::now();
    let mut buf = [0u8; 4];
    assert_eq!(client.read(&mut buf), Err(Error::Timeout));
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(40), "{waited:?}");
    assert!(waited < Duration::from_secs(2), "{waited:?}");
    assert_eq!(dev.fatal_error(), None);

    sim.set_responding(true);
    client.write(&words(&[2])).unwrap();
    assert_eq!(client.read(&mut buf), Ok(4));
    assert_eq!(unwords(&buf), vec![2]);
    assert_eq!(sim.stats().resets, 1);
}

#[test]
fn many_clients_get_their_own_responses() {
    trace_init();
    let sim = SimSbe::new().with_upstream_slots(3);
    let dev = Arc::new(Device::spawn(sim.clone(), fast()).unwrap());

    let workers: Vec<_> = (0..4u32)
        .map(|t| {
            let dev = dev.clone();
            thread::spawn(move || {
                let client = dev.open(Mode::Blocking).unwrap();
                for i in 0..8u32 {
                    let len = 1 + (t * 7 + i * 5) % 40;
                    let req: Vec<u32> = (0..len).map(|w| t << 24 | i << 16 | w).collect();
                    client.write(&words(&req)).unwrap();
                    let out = read_exact(&client, req.len() * 4).unwrap();
                    assert_eq!(unwords(&out), req);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(sim.requests().len(), 32);
    assert_eq!(sim.stats().eot_acked, 32);
    assert_eq!(dev.queued_transfers(), 0);
}

#[test]
fn removal_wakes_blocked_readers() {
    trace_init();
    let mut dev = Device::spawn(SimSbe::new().silent(), fast()).unwrap();
    let client = Arc::new(dev.open(Mode::Blocking).unwrap());
    client.write(&words(&[1])).unwrap();

    let reader = {
        let client = client.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 4];
            client.read(&mut buf)
        })
    };
    thread::sleep(Duration::from_millis(20));
    dev.remove();
    assert_eq!(reader.join().unwrap(), Err(Error::Removed));
}
