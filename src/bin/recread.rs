//! recread - dump the records of a tape image
//!
//! Reads a tape image from a file or standard input and writes the record
//! contents, without the framing, to standard output. Useful for getting
//! at the data of a tape written through rtape, e.g. to feed it to tar.

use chaosnet_tape::{Record, RecordReader};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "recread")]
#[command(about = "Write the records of a tape image to standard output without the record markers")]
#[command(version)]
struct Cli {
    /// Read all records (default)
    #[arg(short = 'a', long = "all", overrides_with = "records")]
    all: bool,

    /// Read N records
    #[arg(short = 'n', long = "records", value_name = "N", overrides_with = "all",
          value_parser = clap::value_parser!(u64).range(1..))]
    records: Option<u64>,

    /// Report marks and records on standard error
    #[arg(short, long)]
    verbose: bool,

    /// Tape image to read (default: standard input)
    input: Option<PathBuf>,
}

/// Why copying stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    EndOfMedium,
    DoubleMark,
    Limit,
}

/// Copies record contents from `reader` to `out`.
///
/// Marks count towards `limit` but produce no output. Returns why copying
/// stopped and how many records (marks included) were read.
fn copy_records<R: Read, W: Write>(
    reader: &mut RecordReader<R>,
    out: &mut W,
    limit: Option<u64>,
    verbose: bool,
) -> Result<(Stop, u64), Box<dyn std::error::Error>> {
    let mut count = 0u64;
    let mut last_was_mark = false;

    while limit.map_or(true, |limit| count < limit) {
        let record = reader
            .read_record()
            .map_err(|e| format!("error reading record {}: {}", count, e))?;

        match record {
            Record::EndOfMedium => return Ok((Stop::EndOfMedium, count)),
            Record::Mark => {
                if last_was_mark {
                    if verbose {
                        eprintln!("[Second mark: EOF]");
                    }
                    return Ok((Stop::DoubleMark, count));
                }
                if verbose {
                    eprintln!("[Mark]");
                }
                last_was_mark = true;
            }
            Record::Data(data) => {
                if verbose {
                    eprintln!("[Rec #{}: {} bytes]", count, data.len());
                }
                last_was_mark = false;
                out.write_all(&data)
                    .map_err(|e| format!("error writing output: {}", e))?;
            }
        }
        count += 1;
    }

    Ok((Stop::Limit, count))
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let input: Box<dyn Read> = match &cli.input {
        Some(path) => Box::new(
            File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?,
        ),
        None => Box::new(io::stdin().lock()),
    };
    let mut reader = RecordReader::new(BufReader::new(input));

    let limit = if cli.all { None } else { cli.records };
    let mut out = io::stdout().lock();
    let (stop, count) = copy_records(&mut reader, &mut out, limit, cli.verbose)?;
    out.flush()?;

    if cli.verbose {
        match stop {
            Stop::EndOfMedium => eprintln!("EOM: Read {} records.", count),
            Stop::DoubleMark | Stop::Limit => eprintln!("Done: read {} records.", count),
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("recread: {}", e);
            ExitCode::FAILURE
        }
    }
}
