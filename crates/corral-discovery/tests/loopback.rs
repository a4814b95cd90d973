use corral_discovery::{Announcer, AnnouncerConfig, Browser, Cancel, PeerRecord};
use std::thread;
use std::time::{Duration, Instant};

fn announcer(name: &str, port: u16, note: &str) -> Announcer {
    let mut rec = PeerRecord::new(name, "127.0.0.1", port);
    rec.note = note.to_owned();
    Announcer::new(rec, AnnouncerConfig::loopback())
}

#[test]
fn browser_finds_loopback_announcer() {
    let a = announcer("Lab Box", 8123, "two GPUs");
    let addr = a.start().unwrap();

    let peers = Browser::with_target(addr)
        .discover(Duration::from_millis(500), &Cancel::new())
        .unwrap();

    assert_eq!(peers.len(), 1);
    let peer = &peers[0];
    assert_eq!(peer.instance, "lab-box");
    assert_eq!(peer.host, "127.0.0.1");
    assert_eq!(peer.port, 8123);
    assert_eq!(peer.note, "two GPUs");
    assert_eq!(peer.url(), "http://127.0.0.1:8123/mcp");
    a.stop();
}

#[test]
fn stopped_announcer_is_not_found() {
    let a = announcer("gone", 8124, "");
    let addr = a.start().unwrap();
    a.stop();

    let peers = Browser::with_target(addr)
        .discover(Duration::from_millis(300), &Cancel::new())
        .unwrap_or_default();
    assert!(peers.is_empty());
}

#[test]
fn cancel_cuts_the_window_short() {
    let a = announcer("slow", 8125, "");
    let addr = a.start().unwrap();
    let cancel = Cancel::new();
    let trigger = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        trigger.cancel();
    });

    let start = Instant::now();
    let peers = Browser::with_target(addr)
        .discover(Duration::from_secs(10), &cancel)
        .unwrap();
    canceller.join().unwrap();

    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(peers.len(), 1);
}
