//! Sort a file of native 8-byte integers with bounded memory.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use corekit::extsort::extsort;
use corekit::order::NaturalOrder;

#[derive(Parser)]
#[command(name = "sorter", version, about)]
struct Args {
    /// File of native-endian i64 records to sort.
    input: PathBuf,

    /// Where the sorted records are written.
    output: PathBuf,

    /// RAM budget in records; must be a multiple of 2*ways.
    #[arg(long, default_value_t = 65536)]
    buf_len: usize,

    /// Merge fan-in (and number of temp files per rotating set).
    #[arg(long, default_value_t = 4)]
    ways: usize,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match extsort::<i64, _>(&args.input, &args.output, args.buf_len, args.ways, NaturalOrder) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("sorter: {err}");
            ExitCode::FAILURE
        }
    }
}
