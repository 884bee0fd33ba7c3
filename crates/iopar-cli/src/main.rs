#![forbid(unsafe_code)]

mod cli;
mod error;
mod signals;

fn main() {
    if let Err(error) = cli::run_from_env() {
        eprintln!("iopar: {error}");
        std::process::exit(error.exit_code());
    }
}
