//! Netio mirroring between two registries in one process over abstract
//! Unix sockets.

use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::time::Duration;

use iopar::iopar_reactor::ManualClock;
use iopar::netio::wire::MTU;
use iopar::{Io, IoError, NetioTuning, ParamId, Tuning};

struct Pair {
    publisher: Io,
    subscriber: Io,
    sub_clock: ManualClock,
}

fn pair(tag: &str) -> (Pair, String) {
    let mut publisher = Io::builder().manual_clock().build();
    let uri = format!("unix:@iopar-it-{tag}-{}", std::process::id());
    let bound = publisher.bind_net(&uri).unwrap();
    assert!(bound.starts_with('@'));
    let sub_clock = ManualClock::new();
    let subscriber = Io::builder().clock(sub_clock.clone()).build();
    (
        Pair {
            publisher,
            subscriber,
            sub_clock,
        },
        uri,
    )
}

impl Pair {
    /// Let each side handle what the other sent, twice over.
    fn exchange(&mut self) {
        for _ in 0..2 {
            self.publisher.cycle(Some(Duration::ZERO)).unwrap();
            self.subscriber.cycle(Some(Duration::ZERO)).unwrap();
        }
    }
}

fn value(io: &mut Io, id: ParamId) -> f64 {
    io.get(id).unwrap()
}

#[test]
fn published_value_reaches_subscriber_and_goes_absent() {
    let (mut p, uri) = pair("rt");
    let x = p.publisher.create("netio:x").unwrap();
    p.publisher.set(x, 1.5).unwrap();
    p.publisher.flush();

    let mirror = p.subscriber.create(&format!("{uri}#x")).unwrap();
    assert!(!p.subscriber.is_present(mirror).unwrap());
    p.exchange();
    assert_eq!(value(&mut p.subscriber, mirror), 1.5);
    assert!(p.subscriber.is_present(mirror).unwrap());

    p.publisher.set(x, 2.0).unwrap();
    p.exchange();
    assert_eq!(value(&mut p.subscriber, mirror), 2.0);

    drop(p.publisher);
    p.sub_clock.advance(Duration::from_millis(1900));
    p.subscriber.fire_timers();
    assert!(p.subscriber.is_present(mirror).unwrap());
    p.sub_clock.advance(Duration::from_millis(100));
    p.subscriber.fire_timers();
    assert!(!p.subscriber.is_present(mirror).unwrap());
}

#[test]
fn remote_write_round_trips_through_the_publisher() {
    let (mut p, uri) = pair("wr");
    let open = p.publisher.create("netio:+dimmer").unwrap();
    let locked = p.publisher.create("netio:lock").unwrap();
    p.publisher.set(open, 0.0).unwrap();
    p.publisher.set(locked, 0.0).unwrap();

    let dimmer = p.subscriber.create(&format!("{uri}#dimmer")).unwrap();
    let lock = p.subscriber.create(&format!("{uri}#lock")).unwrap();
    p.exchange();

    p.subscriber.set(dimmer, 0.75).unwrap();
    p.subscriber.set(lock, 1.0).unwrap();
    p.exchange();

    assert_eq!(value(&mut p.publisher, open), 0.75);
    assert_eq!(value(&mut p.publisher, locked), 0.0, "read-only on the publisher");
    assert_eq!(value(&mut p.subscriber, dimmer), 0.75);
    assert_eq!(value(&mut p.subscriber, lock), 0.0);
}

#[test]
fn unknown_names_stay_absent() {
    let (mut p, uri) = pair("unk");
    p.publisher.create("netio:real").unwrap();
    let ghost = p.subscriber.create(&format!("{uri}#ghost")).unwrap();
    p.exchange();
    assert!(!p.subscriber.is_present(ghost).unwrap());
    assert_eq!(value(&mut p.subscriber, ghost), 0.0);
}

#[test]
fn duplicate_names_are_rejected() {
    let (mut p, uri) = pair("dup");
    let first = p.publisher.create("netio:x").unwrap();
    assert!(matches!(
        p.publisher.create("netio:x"),
        Err(IoError::Construction { .. })
    ));
    assert!(p.publisher.create("netio:+x").is_err(), "writability is not part of the name");

    let mirror = p.subscriber.create(&format!("{uri}#x")).unwrap();
    assert!(p.subscriber.create(&format!("{uri}#x")).is_err());

    p.publisher.set(first, 4.0).unwrap();
    p.publisher.flush();
    p.exchange();
    assert_eq!(value(&mut p.subscriber, mirror), 4.0);

    p.publisher.destroy(first);
    assert!(p.publisher.create("netio:x").is_ok(), "name is free again");
}

#[test]
fn large_snapshot_is_split_under_the_mtu() {
    let mut publisher = Io::builder().manual_clock().build();
    let name = format!("iopar-it-mtu-{}", std::process::id());
    publisher.bind_net(&format!("unix:@{name}")).unwrap();
    let names: Vec<String> = (0..200).map(|n| format!("sensor_{n:03}")).collect();
    for (n, param) in names.iter().enumerate() {
        let id = publisher.create(&format!("netio:{param}")).unwrap();
        publisher.set(id, n as f64).unwrap();
    }
    publisher.flush();

    let consumer_addr =
        SocketAddr::from_abstract_name(format!("iopar-it-mtu-peer-{}", std::process::id())).unwrap();
    let consumer = UnixDatagram::bind_addr(&consumer_addr).unwrap();
    consumer.set_nonblocking(true).unwrap();
    let publisher_addr = SocketAddr::from_abstract_name(&name).unwrap();
    consumer.send_to_addr(b"*subscribe\n", &publisher_addr).unwrap();
    publisher.cycle(Some(Duration::ZERO)).unwrap();

    let mut packets = Vec::new();
    let mut buf = [0u8; 4096];
    while let Ok(len) = consumer.recv(&mut buf) {
        packets.push(String::from_utf8(buf[..len].to_vec()).unwrap());
    }
    assert!(packets.len() > 1, "snapshot fits one datagram: {}", packets.len());
    assert!(packets.iter().all(|p| p.len() <= MTU));
    assert!(packets[0].starts_with("*initial\n"));

    let assigned: Vec<&str> = packets
        .iter()
        .flat_map(|p| p.lines())
        .filter_map(|line| line.split_once('=').map(|(name, _)| name))
        .collect();
    assert_eq!(assigned, names);
}

#[test]
fn zero_keepalive_does_not_spin() {
    let tuning = Tuning {
        netio: NetioTuning {
            keepalive_secs: 0.0,
            ..NetioTuning::default()
        },
        ..Tuning::default()
    };
    let clock = ManualClock::new();
    let mut io = Io::builder().clock(clock.clone()).tuning(tuning).build();
    io.bind_net(&format!("unix:@iopar-it-zero-{}", std::process::id()))
        .unwrap();
    io.create("netio:x").unwrap();

    clock.advance(Duration::from_millis(50));
    io.fire_timers();
    let next = io.next_deadline().unwrap();
    assert!(next > io.now(), "repeating timer stays ahead of the clock");
}
