//! sortmerge CLI
//!
//! Runs the engine on a generated workload or on a text file of
//! `key count` lines.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args as ClapArgs, Parser, Subcommand};
use sortmerge::{
    IntPairComparator, IntPairSerializer, IoManager, IterSource, MemoryManager, RecordIterator,
    ReduceCombiner, SortError, Sorter, SorterConfig,
};
use tracing_subscriber::{fmt, EnvFilter};

/// sortmerge CLI
#[derive(Parser, Debug)]
#[command(name = "sortmerge-cli")]
#[command(about = "External sort/merge engine with spilling and combining")]
#[command(version)]
struct Args {
    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ClapArgs, Debug)]
struct EngineArgs {
    /// Memory for the sorter in KB
    #[arg(short, long, default_value = "1024", global = true)]
    memory_kb: usize,

    /// Segment size in bytes
    #[arg(short, long, default_value = "32768", global = true)]
    page_size: usize,

    /// Maximum spill channels merged at once
    #[arg(short = 'f', long, default_value = "128", global = true)]
    max_file_handles: usize,

    /// Directory for spill files (default: a fresh directory under the system temp dir)
    #[arg(short, long, global = true)]
    spill_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sum `occurrences` copies of `(key, 1)` for every key and check the result
    Generate {
        /// Number of distinct keys
        #[arg(short, long, default_value = "10000")]
        keys: i32,

        /// Occurrences per key
        #[arg(short, long, default_value = "100")]
        occurrences: i32,
    },

    /// Sort a file of `key count` lines
    Sort {
        /// Input file
        input: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Sum the counts of equal keys
        #[arg(short, long)]
        combine: bool,

        /// Sort keys in descending order
        #[arg(short, long)]
        descending: bool,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sortmerge=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    tracing::info!("sortmerge v{}", sortmerge::VERSION);

    let spill_dir = args
        .engine
        .spill_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join(format!("sortmerge-{}", std::process::id())));

    let result = match args.command {
        Commands::Generate { keys, occurrences } => {
            run_generate(&args.engine, &spill_dir, keys, occurrences)
        }
        Commands::Sort {
            input,
            output,
            combine,
            descending,
        } => run_sort(&args.engine, &spill_dir, input, output, combine, descending),
    };

    if args.engine.spill_dir.is_none() {
        let _ = std::fs::remove_dir_all(&spill_dir);
    }

    if let Err(e) = result {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn managers(engine: &EngineArgs, spill_dir: &PathBuf) -> sortmerge::Result<(Arc<MemoryManager>, Arc<IoManager>)> {
    let memory = Arc::new(MemoryManager::new(engine.memory_kb * 1024, engine.page_size)?);
    let io = Arc::new(IoManager::new(spill_dir)?);
    Ok((memory, io))
}

fn config(engine: &EngineArgs) -> SorterConfig {
    SorterConfig::builder()
        .memory_fraction(1.0)
        .max_file_handles(engine.max_file_handles)
        .build()
}

fn run_generate(engine: &EngineArgs, spill_dir: &PathBuf, keys: i32, occurrences: i32) -> sortmerge::Result<()> {
    let (memory, io) = managers(engine, spill_dir)?;

    let total = keys as i64 * occurrences as i64;
    tracing::info!(keys, occurrences, total, "Generating workload");

    let input = IterSource::new((0..occurrences).flat_map(move |_| (0..keys).map(|key| (key, 1))));

    let started = Instant::now();
    let mut sorter = Sorter::builder(
        Arc::clone(&memory),
        Arc::new(IntPairSerializer),
        Arc::new(IntPairComparator::ascending()),
    )
    .io_manager(io)
    .combiner(ReduceCombiner::new(|a: (i32, i32), b: (i32, i32)| (a.0, a.1 + b.1)))
    .config(config(engine))
    .build(input)?;

    let mut records = 0i64;
    let mut sum = 0i64;
    let mut wrong = 0i64;
    let mut previous: Option<i32> = None;
    for record in sorter.get_iterator()? {
        let (key, count) = record?;
        if previous.map_or(false, |p| p > key) || count != occurrences {
            wrong += 1;
        }
        previous = Some(key);
        records += 1;
        sum += count as i64;
    }
    sorter.close()?;

    println!("records:  {}", records);
    println!("sum:      {} (expected {})", sum, total);
    println!("mismatch: {}", wrong);
    println!("elapsed:  {:?}", started.elapsed());
    println!("leaked:   {} segments", memory.outstanding_segments());

    if wrong > 0 || sum != total || records != keys as i64 {
        return Err(SortError::Config("result does not match the workload".into()));
    }
    Ok(())
}

fn run_sort(
    engine: &EngineArgs,
    spill_dir: &PathBuf,
    input: PathBuf,
    output: Option<PathBuf>,
    combine: bool,
    descending: bool,
) -> sortmerge::Result<()> {
    let (memory, io) = managers(engine, spill_dir)?;
    let source = LineSource::new(BufReader::new(File::open(&input)?));

    let comparator = if descending {
        IntPairComparator::descending()
    } else {
        IntPairComparator::ascending()
    };

    let started = Instant::now();
    let builder = Sorter::builder(Arc::clone(&memory), Arc::new(IntPairSerializer), Arc::new(comparator))
        .io_manager(io)
        .config(config(engine));
    let builder = if combine {
        builder.combiner(ReduceCombiner::new(|a: (i32, i32), b: (i32, i32)| (a.0, a.1 + b.1)))
    } else {
        builder
    };
    let mut sorter = builder.build(source)?;

    let mut out: Box<dyn Write> = match &output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let mut records = 0u64;
    for record in sorter.get_iterator()? {
        let (key, count) = record?;
        writeln!(out, "{} {}", key, count)?;
        records += 1;
    }
    out.flush()?;
    sorter.close()?;

    tracing::info!(records, elapsed = ?started.elapsed(), "Sorted {}", input.display());
    Ok(())
}

/// `key count` pairs read line by line; blank lines are skipped
struct LineSource<R> {
    reader: R,
    line: String,
    line_number: usize,
}

impl<R: BufRead> LineSource<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_number: 0,
        }
    }

    fn parse(&self) -> Result<(i32, i32), String> {
        let mut fields = self.line.split_whitespace();
        let key = fields.next().ok_or("missing key")?;
        let count = fields.next().unwrap_or("1");
        let key = key.parse().map_err(|e| format!("bad key {:?}: {}", key, e))?;
        let count = count.parse().map_err(|e| format!("bad count {:?}: {}", count, e))?;
        Ok((key, count))
    }
}

impl<R: BufRead> RecordIterator<(i32, i32)> for LineSource<R> {
    fn next(&mut self) -> sortmerge::Result<Option<(i32, i32)>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            if self.line.trim().is_empty() {
                continue;
            }
            return self
                .parse()
                .map(Some)
                .map_err(|e| SortError::Source(format!("line {}: {}", self.line_number, e).into()));
        }
    }
}
