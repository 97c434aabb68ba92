//! Lives in its own test binary because it installs the global logger.

use std::{sync::Mutex, time::Duration};

use fleetmux::ssh_mux::OwnerToken;
use harness::{Fixture, Kind, Outcome};
use log::{Level, LevelFilter, Log, Metadata, Record};

mod harness;

struct Capture(Mutex<Vec<(Level, String)>>);

impl Log for Capture {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.0
            .lock()
            .unwrap()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture(Mutex::new(Vec::new()));

#[test]
fn booting_host_is_retried_with_delay() {
    log::set_logger(&CAPTURE).unwrap();
    log::set_max_level(LevelFilter::Debug);

    let fixture = Fixture::new(&["web1"]);
    let masters = fixture.masters();
    let target = fixture.target("web1");
    fixture.fake.script("web1", [Outcome::BootingUp; 3]);

    let token = OwnerToken::generate();
    masters.acquire(&target, &token, None).unwrap();

    let creations: Vec<_> = fixture
        .fake
        .calls()
        .into_iter()
        .filter(|c| c.kind == Kind::Create)
        .collect();
    assert_eq!(creations.len(), 4);
    for pair in creations.windows(2) {
        assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_millis(50));
    }

    assert_eq!(masters.owners(&target.key).unwrap(), vec![token.to_string()]);

    let records = CAPTURE.0.lock().unwrap();
    let retries: Vec<_> = records
        .iter()
        .filter(|(level, message)| *level == Level::Warn && message.contains("booting up"))
        .collect();
    assert_eq!(retries.len(), 3, "{:?}", *records);
    assert!(records
        .iter()
        .any(|(level, message)| *level == Level::Info && message.contains("control master created")));
}
