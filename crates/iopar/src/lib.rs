#![forbid(unsafe_code)]

//! iopar: named numeric I/O parameters for home automation.
//!
//! An [`Io`] owns a table of parameters created from spec strings such as
//! `virtual:3`, `sysfs:/sys/class/thermal/thermal_zone0/temp,delay=5` or
//! `netio:kitchen.light`. Each parameter carries a value and a
//! [`ParamState`]; writes and device events raise `DIRTY`, and
//! [`Io::flush`] publishes the dirty set to netio peers and notifiers
//! before clearing it.
//!
//! # Key Components
//!
//! - [`Io`] - the registry and its event loop ([`Io::run_once`], [`Io::cycle`])
//! - backends - `virtual`, `sysfs`, `led`/`bled`/`backlight`, input devices
//! - actuators - `dmotor`/`pmotor`, `teleruptor`, `shared`
//! - [`netio`] - parameter mirroring over Unix and UDP datagrams
//! - [`longdet`] - short/long press detection
//! - [`quota`] - system-wide resource quota daemon and client
//!
//! Everything runs on one thread. Handlers take `&mut Io` and run to
//! completion before the loop blocks again.

mod actuators;
mod backend;
mod backends;
pub mod config;
pub mod error;
mod event_loop;
pub mod longdet;
pub mod netio;
mod notify;
pub mod quota;
mod registry;
pub mod spec;
mod state;
mod table;
pub mod tuning;

pub use config::{Consts, Presets};
pub use error::{IoError, Result};
pub use longdet::{LongDetId, Press};
pub use notify::{NotifierId, NotifyFn};
pub use registry::{Io, IoBuilder};
pub use state::{ParamId, ParamState, same_value, to_bool};
pub use tuning::{
    LongPressTuning, MotorTuning, NetioTuning, PathTuning, QuotaTuning, SharedTuning,
    SysfsTuning, TeleruptorTuning, Tuning, TuningError,
};

pub use iopar_reactor;
