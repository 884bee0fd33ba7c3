//! Integration tests for the parameter registry: dirty tracking, id reuse,
//! flush and notifier tokens.

use std::cell::Cell;
use std::rc::Rc;

use iopar::{Io, IoError, ParamId, ParamState};

fn io() -> Io {
    Io::builder().manual_clock().build()
}

#[test]
fn dirty_follows_value_changes() {
    let mut io = io();
    let lamp = io.create("netio:+lamp").unwrap();

    io.set(lamp, 1.0).unwrap();
    assert!(io.is_dirty(lamp).unwrap());
    io.flush();
    assert!(!io.is_dirty(lamp).unwrap());

    io.set(lamp, 1.0).unwrap();
    assert!(!io.is_dirty(lamp).unwrap(), "same value is not a change");

    io.set(lamp, f64::NAN).unwrap();
    assert!(io.is_dirty(lamp).unwrap());
    io.flush();
    io.set(lamp, f64::NAN).unwrap();
    assert!(!io.is_dirty(lamp).unwrap(), "NaN equals NaN");
}

#[test]
fn destroyed_id_is_reused_lowest_first() {
    let mut io = io();
    let ids: Vec<ParamId> = (0..5)
        .map(|n| io.create(&format!("netio:p{n}")).unwrap())
        .collect();
    assert_eq!(ids.iter().map(|id| id.get()).collect::<Vec<_>>(), [1, 2, 3, 4, 5]);

    io.destroy(ids[3]);
    io.destroy(ids[1]);
    let again: Vec<u32> = (0..3)
        .map(|n| io.create(&format!("netio:q{n}")).unwrap().get())
        .collect();
    assert_eq!(again, [2, 4, 6]);
}

#[test]
fn second_flush_is_a_noop() {
    let mut io = io();
    let lamp = io.create("netio:lamp").unwrap();
    let calls = Rc::new(Cell::new(0));
    let seen = Rc::clone(&calls);
    io.add_notifier(lamp, move |_, _| seen.set(seen.get() + 1))
        .unwrap();

    io.set(lamp, 0.25).unwrap();
    io.flush();
    io.flush();
    assert_eq!(calls.get(), 1);
    assert!(!io.state(lamp).unwrap().contains(ParamState::DIRTY));
}

#[test]
fn notifier_token_detaches_exactly_one() {
    let mut io = io();
    let lamp = io.create("netio:lamp").unwrap();
    let first = Rc::new(Cell::new(0));
    let second = Rc::new(Cell::new(0));
    let (a, b) = (Rc::clone(&first), Rc::clone(&second));
    let token = io.add_notifier(lamp, move |_, _| a.set(a.get() + 1)).unwrap();
    io.add_notifier(lamp, move |_, _| b.set(b.get() + 1)).unwrap();

    io.remove_notifier(lamp, token).unwrap();
    io.set(lamp, 1.0).unwrap();
    io.flush();
    assert_eq!((first.get(), second.get()), (0, 1));
    assert!(matches!(
        io.remove_notifier(lamp, token),
        Err(IoError::NotFound { .. })
    ));
}

#[test]
fn destroyed_parameter_reports_no_device() {
    let mut io = io();
    let lamp = io.create("netio:lamp").unwrap();
    io.destroy(lamp);
    assert!(matches!(io.get(lamp), Err(IoError::NoDevice(_))));
    assert!(io.set(lamp, 1.0).is_err());
    assert!(io.is_empty());
}

#[test]
fn typed_creation_matches_prefixed_spec() {
    let mut io = io();
    let a = io.create_typed("virtual", "7").unwrap();
    let b = io.create("virtual:7").unwrap();
    io.set(a, 1.0).unwrap();
    assert_eq!(io.get(b).unwrap(), 1.0, "both read bit 7");
    assert_eq!(io.kind(a), Some("virtual"));
}
