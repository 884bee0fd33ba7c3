use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use iopar::quota::{QuotaClient, QuotaServer};
use iopar::{Consts, Io, ParamId, ParamState, Presets, Tuning};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::{CliError, Result};
use crate::signals::StopFlag;

/// Longest a loop blocks before it looks at the stop flag again.
const TICK: Duration = Duration::from_millis(250);

const MIN_REPEAT: Duration = Duration::from_millis(10);
const MAX_REPEAT: Duration = Duration::from_secs(3600);

#[derive(Debug, Parser)]
#[command(name = "iopar", about = "Inspect, publish and arbitrate iopar parameters", version)]
pub struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace). RUST_LOG wins.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Tuning file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    pub tuning: Option<PathBuf>,

    /// Preset files, replacing the default search path.
    #[arg(long = "presets", global = true, value_name = "FILE")]
    pub presets: Vec<PathBuf>,

    /// Const files, replacing the default search path.
    #[arg(long = "consts", global = true, value_name = "FILE")]
    pub consts: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create parameters, optionally write them, and print their values.
    Probe(ProbeArgs),

    /// Publish parameters over netio until interrupted.
    Serve(ServeArgs),

    /// Print every change of the given parameters until interrupted.
    Trace(TraceArgs),

    /// Run the resource quota daemon.
    Resd(ResdArgs),

    /// Ask the quota daemon for an amount.
    Need(NeedArgs),
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Spec strings or preset names.
    #[arg(required = true)]
    pub specs: Vec<String>,

    /// Write this value to every parameter before reading.
    #[arg(long, value_name = "VALUE", allow_negative_numbers = true)]
    pub set: Option<f64>,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Public socket, e.g. `unix:@home` or `udp4:0.0.0.0:4000`. Repeatable.
    #[arg(long = "bind", required = true, value_name = "URI")]
    pub binds: Vec<String>,

    /// Parameters to create, typically `netio:NAME` plus their sources.
    pub specs: Vec<String>,
}

#[derive(Debug, Args)]
pub struct TraceArgs {
    #[arg(required = true)]
    pub specs: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ResdArgs {
    /// Socket to listen on (`@name` or a path).
    #[arg(long, default_value = "@resd", value_name = "URI")]
    pub listen: String,

    /// Total amount to hand out.
    #[arg(long, default_value_t = 1.0)]
    pub capacity: f64,
}

#[derive(Debug, Args)]
pub struct NeedArgs {
    /// Daemon socket.
    #[arg(long, default_value = "@resd", value_name = "URI")]
    pub uri: String,

    /// Client id, unique per requester.
    pub id: String,

    pub amount: f64,

    /// Keep renewing every SECS until interrupted.
    #[arg(long, value_name = "SECS")]
    pub repeat: Option<f64>,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    run(cli)
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    let tuning = load_tuning(cli.tuning.as_deref())?;
    match &cli.command {
        Commands::Resd(args) => return resd(args, &tuning),
        Commands::Need(args) => return need(args),
        _ => {}
    }

    let mut builder = Io::builder().tuning(tuning);
    if !cli.presets.is_empty() {
        builder = builder.presets(Presets::load_default(&cli.presets));
    }
    if !cli.consts.is_empty() {
        builder = builder.consts(Consts::load_default(&cli.consts));
    }
    let mut io = builder.build();

    match cli.command {
        Commands::Probe(args) => probe(&mut io, &args),
        Commands::Serve(args) => serve(&mut io, &args),
        Commands::Trace(args) => trace(&mut io, &args),
        Commands::Resd(_) | Commands::Need(_) => Ok(()),
    }
}

fn load_tuning(path: Option<&Path>) -> Result<Tuning> {
    let Some(path) = path else {
        return Ok(Tuning::default());
    };
    Ok(Tuning::load_validated(path)?)
}

fn create_all(io: &mut Io, specs: &[String]) -> Result<Vec<ParamId>> {
    specs
        .iter()
        .map(|spec| {
            let id = io.create(spec)?;
            if io.name(id).is_none() {
                io.set_name(id, spec.as_str())?;
            }
            Ok(id)
        })
        .collect()
}

fn describe(io: &mut Io, id: ParamId) -> String {
    let name = io.name(id).unwrap_or("?").to_owned();
    let value = io.get_or(id, f64::NAN);
    let state = io.state(id).unwrap_or_default();
    let absent = if state.contains(ParamState::PRESENT) { "" } else { " (absent)" };
    format!("{name}\t{value}{absent}")
}

fn probe(io: &mut Io, args: &ProbeArgs) -> Result<()> {
    let ids = create_all(io, &args.specs)?;
    if let Some(value) = args.set {
        for id in &ids {
            io.set(*id, value)?;
        }
        io.flush();
    }
    for id in ids {
        println!("{}", describe(io, id));
    }
    Ok(())
}

fn serve(io: &mut Io, args: &ServeArgs) -> Result<()> {
    for uri in &args.binds {
        let bound = io.bind_net(uri)?;
        info!(target: "iopar.cli", %bound, "listening");
    }
    let ids = create_all(io, &args.specs)?;
    for id in ids {
        io.add_notifier(id, |io, id| {
            let line = describe(io, id);
            info!(target: "iopar.cli", "{line}");
        })?;
    }
    run_loop(io)
}

fn trace(io: &mut Io, args: &TraceArgs) -> Result<()> {
    let ids = create_all(io, &args.specs)?;
    for id in &ids {
        println!("{}", describe(io, *id));
        io.add_notifier(*id, |io, id| {
            let at = io.now_secs();
            println!("{at:.3}\t{}", describe(io, id));
        })?;
    }
    run_loop(io)
}

fn run_loop(io: &mut Io) -> Result<()> {
    let stop = StopFlag::install().map_err(CliError::Signals)?;
    while !stop.stopped() {
        io.cycle(Some(TICK))?;
    }
    Ok(())
}

fn resd(args: &ResdArgs, tuning: &Tuning) -> Result<()> {
    let mut server = QuotaServer::bind(&args.listen, args.capacity, &tuning.quota)?;
    let stop = StopFlag::install().map_err(CliError::Signals)?;
    while !stop.stopped() {
        server.poll_once(Some(TICK))?;
    }
    Ok(())
}

fn need(args: &NeedArgs) -> Result<()> {
    let mut client = QuotaClient::new();
    let Some(every) = args.repeat else {
        return if client.take(&args.uri, &args.id, args.amount)? {
            println!("ack {}", args.amount);
            Ok(())
        } else {
            println!("nack");
            Err(CliError::Refused(args.id.clone()))
        };
    };

    let every = repeat_period(every);
    let stop = StopFlag::install().map_err(CliError::Signals)?;
    let mut granted = None;
    while !stop.stopped() {
        match client.take(&args.uri, &args.id, args.amount) {
            Ok(ack) if granted != Some(ack) => {
                println!("{}", if ack { "ack" } else { "nack" });
                granted = Some(ack);
            }
            Ok(_) => {}
            Err(err) => warn!(target: "iopar.cli", %err, "no answer"),
        }
        let mut left = every;
        while !left.is_zero() && !stop.stopped() {
            let nap = left.min(TICK);
            std::thread::sleep(nap);
            left -= nap;
        }
    }
    Ok(())
}

/// Renewal period for `need --repeat`, kept between [`MIN_REPEAT`] and
/// [`MAX_REPEAT`].
fn repeat_period(secs: f64) -> Duration {
    if !(secs > 0.0) {
        return MIN_REPEAT;
    }
    Duration::try_from_secs_f64(secs)
        .unwrap_or(MAX_REPEAT)
        .clamp(MIN_REPEAT, MAX_REPEAT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["iopar", "probe", "virtual:1", "-vv", "--set", "-1"]).unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Probe(args) = cli.command else {
            panic!("expected probe");
        };
        assert_eq!(args.specs, ["virtual:1"]);
        assert_eq!(args.set, Some(-1.0));
    }

    #[test]
    fn serve_needs_a_bind() {
        assert!(Cli::try_parse_from(["iopar", "serve", "netio:x"]).is_err());
        let cli = Cli::try_parse_from(["iopar", "serve", "--bind", "unix:@h", "netio:x"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve(ref a) if a.binds == ["unix:@h"]));
    }

    #[test]
    fn need_defaults_to_resd_socket() {
        let cli = Cli::try_parse_from(["iopar", "need", "heater", "0.5"]).unwrap();
        let Commands::Need(args) = cli.command else {
            panic!("expected need");
        };
        assert_eq!(args.uri, "@resd");
        assert_eq!(args.amount, 0.5);
        assert!(args.repeat.is_none());
    }

    #[test]
    fn repeat_period_is_bounded() {
        assert_eq!(repeat_period(0.5), Duration::from_millis(500));
        assert_eq!(repeat_period(0.0), MIN_REPEAT);
        assert_eq!(repeat_period(-3.0), MIN_REPEAT);
        assert_eq!(repeat_period(f64::NAN), MIN_REPEAT);
        assert_eq!(repeat_period(f64::INFINITY), MAX_REPEAT);
        assert_eq!(repeat_period(1e300), MAX_REPEAT);
    }

    #[test]
    fn probe_writes_virtual_bits() {
        let cli = Cli::try_parse_from(["iopar", "probe", "virtual:4", "--set", "1"]).unwrap();
        run(cli).unwrap();
    }

    #[test]
    fn unknown_type_is_a_configuration_error() {
        let cli = Cli::try_parse_from(["iopar", "probe", "bogus:1"]).unwrap();
        let err = run(cli).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn tuning_file_is_validated() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[netio]\nkeepalive_secs = -1.0").unwrap();
        let err = load_tuning(Some(file.path())).unwrap_err();
        assert!(matches!(err, CliError::Tuning(_)));
        assert!(load_tuning(None).is_ok());
    }

    #[test]
    fn preset_file_resolves_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets");
        std::fs::write(&path, "lamp virtual:5\n").unwrap();
        let presets = path.to_string_lossy().into_owned();
        let cli = Cli::try_parse_from(["iopar", "probe", "lamp", "--presets", &presets]).unwrap();
        run(cli).unwrap();
    }
}
