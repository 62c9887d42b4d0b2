use ostium::reactor::{Completion, EventHandler, EventMask, Reactor};
use ostium::{Application, Error, Runtime};

use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct Noop;

impl EventHandler for Noop {
    fn on_event(
        &mut self,
        _reactor: &Reactor,
        _fd: RawFd,
        _events: EventMask,
    ) -> ostium::Result<Completion> {
        Ok(Completion::READ)
    }
}

#[test]
fn add_rejects_a_second_registration() {
    let reactor = Reactor::new().expect("Failed to create reactor");
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
    let fd = listener.as_raw_fd();

    reactor
        .add(fd, EventMask::IN, Box::new(Noop))
        .expect("Failed to register descriptor");

    match reactor.add(fd, EventMask::IN, Box::new(Noop)) {
        Err(Error::AlreadyRegistered(reported)) => assert_eq!(reported, fd),
        other => panic!("expected AlreadyRegistered, got {other:?}"),
    }

    reactor.remove(fd).expect("Failed to remove descriptor");
}

#[test]
fn modify_and_remove_require_an_active_entry() {
    let reactor = Reactor::new().expect("Failed to create reactor");
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
    let fd = listener.as_raw_fd();

    assert!(matches!(
        reactor.modify(fd, EventMask::IN),
        Err(Error::NotActive(_))
    ));
    assert!(matches!(reactor.remove(fd), Err(Error::NotActive(_))));

    reactor
        .add(fd, EventMask::IN, Box::new(Noop))
        .expect("Failed to register descriptor");
    reactor
        .modify(fd, EventMask::IN | EventMask::OUT)
        .expect("Failed to modify registration");
    reactor.remove(fd).expect("Failed to remove descriptor");

    assert!(matches!(reactor.remove(fd), Err(Error::NotActive(_))));
}

#[test]
fn out_of_table_descriptors_are_rejected() {
    let reactor = Reactor::new().expect("Failed to create reactor");

    assert!(matches!(
        reactor.add(-1, EventMask::IN, Box::new(Noop)),
        Err(Error::OutOfTable(-1))
    ));

    let beyond = reactor.capacity() as RawFd;
    assert!(matches!(
        reactor.add(beyond, EventMask::IN, Box::new(Noop)),
        Err(Error::OutOfTable(_))
    ));
}

struct CountingApp {
    runtime: Arc<Runtime>,
    created: Arc<AtomicUsize>,
    idled: Arc<AtomicUsize>,
    destroyed: Arc<AtomicUsize>,
}

impl Application for CountingApp {
    fn create(&mut self, runtime: &Runtime) -> ostium::Result<()> {
        self.created.fetch_add(1, Ordering::SeqCst);
        // Make the first readiness wait return immediately so idle runs
        // without waiting out the tick timeout.
        runtime.wakeup();
        Ok(())
    }

    fn idle(&mut self) {
        if self.idled.fetch_add(1, Ordering::SeqCst) == 0 {
            self.runtime.stop(5);
        }
    }

    fn destroy(&mut self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn application_lifecycle_runs_around_the_loop() {
    let runtime = Arc::new(Runtime::new().expect("Failed to create runtime"));

    let created = Arc::new(AtomicUsize::new(0));
    let idled = Arc::new(AtomicUsize::new(0));
    let destroyed = Arc::new(AtomicUsize::new(0));

    let mut app = CountingApp {
        runtime: runtime.clone(),
        created: created.clone(),
        idled: idled.clone(),
        destroyed: destroyed.clone(),
    };

    let code = runtime.run(&mut app).expect("Run failed");

    assert_eq!(code, 5);
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert!(idled.load(Ordering::SeqCst) >= 1);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

struct Quiet;

impl Application for Quiet {}

#[test]
fn stop_from_a_worker_thread_returns_its_code() {
    let runtime = Arc::new(Runtime::new().expect("Failed to create runtime"));

    let stopper = {
        let runtime = runtime.clone();
        thread::spawn(move || {
            // Let the loop reach its idle readiness wait first.
            thread::sleep(Duration::from_millis(100));
            runtime.stop(7);
        })
    };

    let started = std::time::Instant::now();
    let code = runtime.run(&mut Quiet).expect("Run failed");

    assert_eq!(code, 7);
    // One tick, not the full 30-second wait: the signal pipe interrupts
    // the blocked readiness wait.
    assert!(started.elapsed() < Duration::from_secs(5));

    stopper.join().expect("Thread panicked");
}

#[test]
fn wakeup_interrupts_an_idle_wait() {
    let runtime = Arc::new(Runtime::new().expect("Failed to create runtime"));

    let waker = {
        let runtime = runtime.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            runtime.wakeup();
            thread::sleep(Duration::from_millis(50));
            runtime.stop(0);
        })
    };

    let code = runtime.run(&mut Quiet).expect("Run failed");
    assert_eq!(code, 0);

    waker.join().expect("Thread panicked");
}
