//! Integration tests for shared parameters, teleruptors, motors and the
//! long-press detector.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use iopar::iopar_reactor::ManualClock;
use iopar::{Io, IoError, Press, TeleruptorTuning, Tuning};
use tracing_subscriber::fmt::MakeWriter;

fn clocked(tuning: Tuning) -> (ManualClock, Io) {
    let clock = ManualClock::new();
    let io = Io::builder().clock(clock.clone()).tuning(tuning).build();
    (clock, io)
}

fn step(clock: &ManualClock, io: &mut Io, by: Duration) {
    clock.advance(by);
    io.fire_timers();
}

// ── shared ──────────────────────────────────────────────────────────────

#[test]
fn shared_arbitration_between_two_clients() {
    let (_clock, mut io) = clocked(Tuning::default());
    let a = io.create("shared:netio:heater").unwrap();
    let b = io.create("shared:netio:heater").unwrap();
    let backing = io.params()[1];

    io.set(a, 0.8).unwrap();
    assert_eq!(io.get(backing).unwrap(), 0.8);

    let before = io.get(b).unwrap();
    assert!(matches!(io.set(b, 0.3), Err(IoError::Busy(_))));
    assert_eq!(io.get(b).unwrap(), before, "refused write leaves B alone");
    assert_eq!(io.get(backing).unwrap(), 0.8);

    io.set(a, f64::NAN).unwrap();
    assert_eq!(io.get(backing).unwrap(), 0.0);

    io.set(b, 0.3).unwrap();
    assert_eq!(io.get(backing).unwrap(), 0.3);
    assert_eq!(io.get(a).unwrap(), 0.3, "clients mirror the backing value");
}

#[test]
fn shared_contributor_keeps_value_when_another_withdraws() {
    let (_clock, mut io) = clocked(Tuning::default());
    let a = io.create("shared:netio:fan").unwrap();
    let b = io.create("shared:netio:fan").unwrap();
    let backing = io.params()[1];
    io.set(a, 0.5).unwrap();
    io.set(b, 0.5).unwrap();
    io.set(b, f64::NAN).unwrap();
    assert_eq!(io.get(backing).unwrap(), 0.5);
}

// ── teleruptor ──────────────────────────────────────────────────────────

#[test]
fn teleruptor_retry_bound_is_tunable() {
    let tuning = Tuning {
        teleruptor: TeleruptorTuning {
            max_pulses: 5,
            ..TeleruptorTuning::default()
        },
        ..Tuning::default()
    };
    let (clock, mut io) = clocked(tuning);
    let relay = io.create("teleruptor:virtual:0+virtual:1").unwrap();
    let coil = io.params()[1];
    io.set(relay, 1.0).unwrap();

    let mut pulses = 0;
    for _ in 0..30 {
        if io.get(coil).unwrap() == 1.0 {
            pulses += 1;
        }
        if io.next_deadline().is_none() {
            break;
        }
        step(&clock, &mut io, Duration::from_millis(200));
    }
    assert_eq!(pulses, 5);
    assert!(io.next_deadline().is_none(), "parked idle");
    assert_eq!(io.get(relay).unwrap(), 0.0);
}

/// Log sink shared with a scoped subscriber.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn teleruptor_gives_up_with_a_warning() {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(captured.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        let (clock, mut io) = clocked(Tuning::default());
        let relay = io.create("teleruptor:virtual:0+virtual:1").unwrap();
        io.set(relay, 1.0).unwrap();
        while io.next_deadline().is_some() {
            step(&clock, &mut io, Duration::from_millis(200));
        }
    });
    let logged = captured.text();
    assert_eq!(logged.matches("giving up").count(), 1, "{logged}");
    assert!(logged.contains("WARN"));
}

// ── motor ───────────────────────────────────────────────────────────────

#[test]
fn motor_pair_tracks_position() {
    let (clock, mut io) = clocked(Tuning::default());
    let (dir, pos) = io.create_motor("updown+virtual:0+virtual:1+10").unwrap();
    let up = io.create("virtual:0").unwrap();
    let down = io.create("virtual:1").unwrap();

    io.set(dir, 1.0).unwrap();
    assert_eq!((io.get(up).unwrap(), io.get(down).unwrap()), (1.0, 0.0));
    for _ in 0..5 {
        step(&clock, &mut io, Duration::from_secs(1));
    }
    let half = io.get(pos).unwrap();
    assert!((half - 0.5).abs() < 0.02, "position {half}");

    io.set(dir, 0.0).unwrap();
    assert_eq!(io.get(up).unwrap(), 0.0);
    io.destroy(dir);
    io.destroy(pos);
    assert!(io.next_deadline().is_none());
}

#[test]
fn motor_with_dead_outputs_parks_and_says_so() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("gone");
    let spec = format!(
        "updown+sysfs:{}+sysfs:{}+10",
        missing.join("up").display(),
        missing.join("down").display()
    );
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(captured.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        let (clock, mut io) = clocked(Tuning::default());
        let (motor, _pos) = io.create_motor(&spec).unwrap();
        io.set(motor, 1.0).unwrap();
        for _ in 0..10 {
            step(&clock, &mut io, Duration::from_millis(200));
        }
        assert!(io.next_deadline().is_none(), "parked idle");
        assert_eq!(io.get(motor).unwrap(), 0.0);
    });
    let logged = captured.text();
    assert_eq!(logged.matches("parking").count(), 2, "{logged}");
    assert!(logged.contains("cannot stop outputs while parking"));
}

// ── long press ──────────────────────────────────────────────────────────

#[test]
fn short_hold_yields_one_short_edge() {
    let (clock, mut io) = clocked(Tuning::default());
    let det = io.new_longdet_with(Duration::from_millis(500));
    let mut edges = Vec::new();

    io.set_longdet(det, 1.0);
    for ms in [100, 100, 100] {
        step(&clock, &mut io, Duration::from_millis(ms));
        if io.longdet_edge(det) {
            edges.push(io.longdet_state(det));
        }
        io.flush();
    }
    io.set_longdet(det, 0.0);
    for _ in 0..3 {
        if io.longdet_edge(det) {
            edges.push(io.longdet_state(det));
        }
        io.flush();
        step(&clock, &mut io, Duration::from_millis(300));
    }
    // The return to None after a short press is an edge too.
    assert_eq!(edges, [Press::Short, Press::None]);
}

#[test]
fn long_hold_yields_one_long_edge() {
    let (clock, mut io) = clocked(Tuning::default());
    let det = io.new_longdet_with(Duration::from_millis(500));
    let mut edges = Vec::new();

    io.set_longdet(det, 1.0);
    for _ in 0..10 {
        step(&clock, &mut io, Duration::from_millis(100));
        if io.longdet_edge(det) {
            edges.push(io.longdet_state(det));
        }
        io.flush();
    }
    io.set_longdet(det, 0.0);
    if io.longdet_edge(det) {
        edges.push(io.longdet_state(det));
    }
    io.flush();
    assert_eq!(edges, [Press::Long, Press::None]);
    assert!(!edges.contains(&Press::Short));
}
