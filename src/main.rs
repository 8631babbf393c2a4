//! Purpose: `leaseio` CLI entry point; copies and digests files through the buffer pipeline.
//! Role: Binary crate root; parses args, runs one command, emits JSON on stdout.
//! Invariants: Errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Diagnostics go through `tracing` to stderr and never touch stdout.
use std::error::Error as StdError;
use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde::Serialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

use leaseio::api::{
    AnyReader, BufferPool, Error, ErrorKind, FileWriterFactory, MemoryReaderFactory, PoolOptions,
    Reader, ReaderFactory, ReaderOptions, Writer, WriterFactory, WriterOptions, blocking,
    to_exit_code,
};

#[derive(Parser)]
#[command(
    name = "leaseio",
    version,
    about = "Stream files through a bounded pool of leased buffers",
    long_about = None
)]
struct Cli {
    #[arg(long, default_value_t = 4, help = "Number of buffers in the pool")]
    buffers: usize,
    #[arg(
        long,
        default_value_t = 256 * 1024,
        help = "Capacity of each pool buffer in bytes"
    )]
    buffer_size: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy a byte range of SRC into DST.
    Copy(CopyArgs),
    /// Print the SHA-256 of a byte range of PATH.
    Digest(DigestArgs),
}

#[derive(Args)]
struct RangeArgs {
    #[arg(long, default_value_t = 0, help = "First byte to read")]
    offset: u64,
    #[arg(long, help = "Bytes to read (default: to end of file)")]
    length: Option<u64>,
}

impl RangeArgs {
    fn reader_options(&self) -> ReaderOptions {
        let options = ReaderOptions::new().with_offset(self.offset).with_max_buffers(0);
        match self.length {
            Some(length) => options.with_size(length),
            None => options,
        }
    }
}

#[derive(Args)]
struct CopyArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    src: PathBuf,
    #[arg(value_hint = ValueHint::FilePath)]
    dst: PathBuf,
    #[command(flatten)]
    range: RangeArgs,
    #[arg(long, help = "Sync DST to disk before reporting success")]
    fsync: bool,
    #[arg(long, help = "Reserve the full length of DST before writing")]
    preallocate: bool,
    #[arg(long, help = "Give DST the modification time of SRC")]
    preserve_mtime: bool,
}

#[derive(Args)]
struct DigestArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    path: PathBuf,
    #[command(flatten)]
    range: RangeArgs,
    #[arg(long, help = "Memory-map PATH instead of reading it on a worker thread")]
    mmap: bool,
}

#[derive(Serialize)]
struct CopyReport {
    copied: u64,
    src: String,
    dst: String,
}

#[derive(Serialize)]
struct DigestReport {
    path: String,
    bytes: u64,
    sha256: String,
    mtime: Option<String>,
}

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                return Ok(0);
            }
            _ => {
                let rendered = err.render().to_string();
                let summary = rendered
                    .lines()
                    .find(|line| !line.trim().is_empty())
                    .unwrap_or("invalid arguments")
                    .trim_start_matches("error: ")
                    .to_string();
                return Err(Error::new(ErrorKind::Usage).with_message(summary));
            }
        },
    };
    init_tracing();

    let pool = BufferPool::try_new(PoolOptions::new(cli.buffers, cli.buffer_size))?;
    let report = match cli.command {
        Command::Copy(args) => to_json(&copy(&pool, &args)?)?,
        Command::Digest(args) => to_json(&digest(&pool, &args)?)?,
    };
    println!("{report}");
    Ok(0)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init();
}

fn copy(pool: &BufferPool, args: &CopyArgs) -> Result<CopyReport, Error> {
    let source = ReaderFactory::file(&args.src);
    let mut reader = source.open(pool, args.range.reader_options())?;

    let sink = WriterFactory::File(FileWriterFactory::new(&args.dst).with_fsync(args.fsync));
    let mut writer = sink.open(pool, WriterOptions::new().with_max_buffers(0))?;
    if args.preallocate {
        if let Some(size) = reader.size() {
            writer.preallocate(size)?;
        }
    }

    let copied = blocking::copy(&reader, &writer)?;
    if args.preserve_mtime {
        if let Some(mtime) = reader.mtime() {
            writer.set_mtime(mtime)?;
        }
    }
    writer.close();
    reader.close();
    tracing::debug!(copied, src = %args.src.display(), dst = %args.dst.display(), "copy finished");

    Ok(CopyReport {
        copied,
        src: args.src.display().to_string(),
        dst: args.dst.display().to_string(),
    })
}

fn digest(pool: &BufferPool, args: &DigestArgs) -> Result<DigestReport, Error> {
    let source = if args.mmap {
        ReaderFactory::Memory(MemoryReaderFactory::map_file(&args.path)?)
    } else {
        ReaderFactory::file(&args.path)
    };
    let reader: AnyReader = source.open(pool, args.range.reader_options())?;

    let mut hasher = Sha256::new();
    let bytes = blocking::drain(&reader, |chunk| hasher.update(chunk))?;
    let sha256 = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();

    Ok(DigestReport {
        path: args.path.display().to_string(),
        bytes,
        sha256,
        mtime: reader.mtime().and_then(format_time),
    })
}

fn format_time(time: OffsetDateTime) -> Option<String> {
    time.format(&Rfc3339).ok()
}

fn to_json(report: &impl Serialize) -> Result<String, Error> {
    serde_json::to_string(report).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode report")
            .with_source(err)
    })
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::NotFound => "not found",
        ErrorKind::AlreadyExists => "already exists",
        ErrorKind::Permission => "permission denied",
        ErrorKind::Io => "i/o error",
        ErrorKind::Alloc => "buffer allocation failed",
        ErrorKind::Spawn => "failed to start worker",
        ErrorKind::ShortRead => "source ended early",
        ErrorKind::ShortWrite => "sink stopped accepting data",
        ErrorKind::Overflow => "size limit exceeded",
        ErrorKind::Closed => "already closed",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn emit_error(err: &Error) {
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}
