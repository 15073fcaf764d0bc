//! Engine end-to-end against the real kernel interface: timeouts, file
//! and socket I/O, multi-shot accept, overflow and cooperative shutdown.
//!
//! Skips quietly when the running kernel predates 6.8 or refuses
//! io_uring, so the suite stays green on locked-down CI machines.

mod common;

use std::ffi::CString;
use std::fs::File;
use std::io::Write as _;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{observe, Probe};
use once_cell::sync::Lazy;
use riptide::{AsyncIo, Direction, Mode, Signal, Status, SubmitError, Timespec};
use socket2::{Domain, Socket, Type};

static SIG: Lazy<Signal> = Lazy::new(|| Signal::init().expect("signal controller"));
static EXIT_RAN: AtomicBool = AtomicBool::new(false);

fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

fn try_engine<const N: usize>() -> Option<AsyncIo<N>> {
    match AsyncIo::new(true) {
        Ok(engine) => Some(engine),
        Err(e) => {
            // Sandboxes commonly refuse io_uring outright.
            eprintln!("skipping engine test: {}", e);
            None
        }
    }
}

#[test]
fn staging_overflow() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    if !common::uring_supported() {
        eprintln!("skipping engine test: kernel too old");
        return Ok(());
    }
    Lazy::force(&SIG);

    // No reaper drains this engine, so the staging ring fills up.
    let engine = match try_engine::<16>() {
        Some(engine) => engine,
        None => return Ok(()),
    };

    for i in 0..16 {
        let pushed = unsafe { engine.nop(Mode::Async, None, std::ptr::null_mut()) };
        assert!(pushed.is_ok(), "submission {} of 16 refused", i);
    }
    let overflowed = unsafe { engine.nop(Mode::Async, None, std::ptr::null_mut()) };
    assert_eq!(overflowed.unwrap_err(), SubmitError::Overflow);

    // Dropping the engine reclaims the 16 staged records; the debug
    // allocator check inside Drop verifies the 17th was freed on refusal.
    Ok(())
}

#[test]
fn engine_lifecycle() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    if !common::uring_supported() {
        eprintln!("skipping engine test: kernel too old");
        return Ok(());
    }
    Lazy::force(&SIG);

    let engine = match try_engine::<64>() {
        Some(engine) => Arc::new(engine),
        None => return Ok(()),
    };
    assert_eq!(engine.state(), Status::Inactive);

    let reaper = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let on_exit = || EXIT_RAN.store(true, Ordering::Release);
            engine.event_loop(&[&on_exit])
        })
    };
    wait_until("event loop start", Duration::from_secs(5), || {
        engine.state() == Status::Running
    });

    // Nop round-trip.
    let probe = Probe::new();
    unsafe {
        engine.nop(Mode::Async, Some(observe), probe.userdata())?;
    }
    wait_until("nop completion", Duration::from_secs(5), || probe.hits() == 1);
    assert_eq!(probe.last(), 0);

    // Timeout fires once, after the interval, with -ETIME.
    let probe = Probe::new();
    let armed = Instant::now();
    unsafe {
        engine.timeout(
            Timespec { tv_sec: 2, tv_nsec: 0 },
            Mode::Async,
            Some(observe),
            probe.userdata(),
        )?;
    }
    wait_until("timeout expiry", Duration::from_secs(10), || probe.hits() == 1);
    assert!(armed.elapsed() >= Duration::from_millis(1900));
    assert_eq!(probe.last(), -libc::ETIME);

    // Positional file read returns the byte count.
    let mut tmp = tempfile::NamedTempFile::new()?;
    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    tmp.write_all(&payload)?;
    tmp.flush()?;
    let file = File::open(tmp.path())?;
    let mut buf = vec![0u8; 1024];
    let probe = Probe::new();
    unsafe {
        engine.read(
            file.as_raw_fd(),
            buf.as_mut_ptr(),
            1024,
            0,
            Mode::Async,
            Some(observe),
            probe.userdata(),
        )?;
    }
    wait_until("file read", Duration::from_secs(5), || probe.hits() == 1);
    assert_eq!(probe.last(), 1024);
    assert_eq!(buf, payload);

    // Open / statx / close by absolute path.
    let path = CString::new(tmp.path().to_str().unwrap())?;
    let probe = Probe::new();
    unsafe {
        engine.open(&path, libc::O_RDONLY, 0, Mode::Async, Some(observe), probe.userdata())?;
    }
    wait_until("openat", Duration::from_secs(5), || probe.hits() == 1);
    let opened = probe.last();
    assert!(opened >= 0, "openat failed: {}", opened);

    let mut stx: libc::statx = unsafe { std::mem::zeroed() };
    let probe = Probe::new();
    unsafe {
        engine.status(
            &path,
            libc::STATX_SIZE,
            0,
            &mut stx,
            Mode::Async,
            Some(observe),
            probe.userdata(),
        )?;
    }
    wait_until("statx", Duration::from_secs(5), || probe.hits() == 1);
    assert_eq!(probe.last(), 0);
    assert_eq!(stx.stx_size, 1024);

    let probe = Probe::new();
    unsafe {
        engine.close(opened, Mode::Async, Some(observe), probe.userdata())?;
    }
    wait_until("close", Duration::from_secs(5), || probe.hits() == 1);
    assert_eq!(probe.last(), 0);

    // Send and receive across a socket pair.
    let (left, right) = UnixStream::pair()?;
    let mut inbox = vec![0u8; 16];
    let recv_probe = Probe::new();
    unsafe {
        engine.recv(
            right.as_raw_fd(),
            inbox.as_mut_ptr(),
            16,
            Mode::Async,
            Some(observe),
            recv_probe.userdata(),
        )?;
    }
    let outbox = b"riptide says hi!";
    let send_probe = Probe::new();
    unsafe {
        engine.send(
            left.as_raw_fd(),
            outbox.as_ptr(),
            16,
            Mode::Async,
            Some(observe),
            send_probe.userdata(),
        )?;
    }
    wait_until("send", Duration::from_secs(5), || send_probe.hits() == 1);
    wait_until("recv", Duration::from_secs(5), || recv_probe.hits() == 1);
    assert_eq!(send_probe.last(), 16);
    assert_eq!(recv_probe.last(), 16);
    assert_eq!(&inbox[..], &outbox[..]);

    let probe = Probe::new();
    unsafe {
        engine.shutdown(left.as_raw_fd(), Direction::Both, Mode::Async, Some(observe), probe.userdata())?;
    }
    wait_until("socket shutdown", Duration::from_secs(5), || probe.hits() == 1);
    assert_eq!(probe.last(), 0);

    // Multi-shot accept: one submission, one completion per client.
    let socket = Socket::new(Domain::ipv4(), Type::stream(), None)?;
    socket.bind(&"127.0.0.1:0".parse::<SocketAddr>()?.into())?;
    socket.listen(8)?;
    let listener: TcpListener = socket.into_tcp_listener();
    let addr = listener.local_addr()?;
    let accept_probe = Probe::new();
    unsafe {
        engine.accept(
            listener.as_raw_fd(),
            Mode::Async,
            Some(observe),
            accept_probe.userdata(),
        )?;
    }
    let mut clients = Vec::new();
    for i in 0..3 {
        clients.push(TcpStream::connect(addr)?);
        let want = (i + 1) as u32;
        wait_until("accept completion", Duration::from_secs(5), || {
            accept_probe.hits() >= want
        });
    }
    assert!(
        accept_probe.results.lock().iter().take(3).all(|&fd| fd >= 0),
        "accepted descriptors must be valid"
    );

    // Explicit cancel: a distant timeout ends early with -ECANCELED.
    let probe = Probe::new();
    let token = unsafe {
        engine.timeout(
            Timespec { tv_sec: 600, tv_nsec: 0 },
            Mode::Async,
            Some(observe),
            probe.userdata(),
        )?
    };
    let cancel_probe = Probe::new();
    unsafe {
        engine.cancel(token, Mode::Async, Some(observe), cancel_probe.userdata())?;
    }
    wait_until("cancelled timeout", Duration::from_secs(5), || probe.hits() == 1);
    assert_eq!(probe.last(), -libc::ECANCELED);
    wait_until("cancel ack", Duration::from_secs(5), || cancel_probe.hits() == 1);
    assert_eq!(cancel_probe.last(), 0);

    // Shutdown with work in flight: the loop stays in closing until the
    // straggler resolves (cancelled, not waited out), then closes.
    let straggler = Probe::new();
    unsafe {
        engine.timeout(
            Timespec { tv_sec: 60, tv_nsec: 0 },
            Mode::Async,
            Some(observe),
            straggler.userdata(),
        )?;
    }
    thread::sleep(Duration::from_millis(100));

    SIG.latch(libc::SIGTERM);
    let looped = reaper.join().unwrap();
    looped?;

    assert!(EXIT_RAN.load(Ordering::Acquire), "exit callback must run");
    assert_eq!(engine.state(), Status::Closed);
    assert_eq!(engine.ongoing(), 1, "only the self-poll may remain");
    assert_eq!(straggler.hits(), 1);
    assert!(
        straggler.last() == -libc::ECANCELED || straggler.last() == -libc::ETIME,
        "straggler finished with {}",
        straggler.last()
    );

    // The multi-shot accept got its terminal completion during shutdown.
    assert!(accept_probe.hits() >= 4);
    assert_eq!(accept_probe.last(), -libc::ECANCELED);

    // Closed engine refuses new work.
    let refused = unsafe { engine.nop(Mode::Async, None, std::ptr::null_mut()) };
    assert_eq!(refused.unwrap_err(), SubmitError::Closed);

    drop(clients);
    Ok(())
}
