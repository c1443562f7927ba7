use clap::{Args, Parser, Subcommand};
use corpus_dedup::algo::select::RepresentativePolicy;
use corpus_dedup::config::{DedupConfig, ExecutionMode, VerifyMode};
use corpus_dedup::ops;
use corpus_dedup::pipeline::{self, Pipeline};
use corpus_dedup::record::{
    DocumentSink, DocumentSource, JsonlFileSink, JsonlSource, JsonlWriterSink, MemorySource,
    RecordFields, TextDirSink, TextDirSource,
};
use serde_json::Value;
use std::fmt::Display;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "checkpoint")]
use corpus_dedup::algo::storage::SqliteStore;

#[derive(Parser)]
#[command(
    name = "corpus-dedup",
    version,
    about = "Exact and near-duplicate removal for text corpora (MinHash + LSH)"
)]
struct Cli {
    /// Start as an MCP (Model Context Protocol) server on stdio.
    #[cfg(feature = "mcp")]
    #[arg(long, exclusive = true)]
    mcp: bool,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Remove exact and near-duplicate documents
    Run {
        #[command(flatten)]
        io: IoArgs,
        #[command(flatten)]
        config: ConfigArgs,
        /// Write the stats JSON here instead of stderr
        #[arg(long)]
        stats: Option<PathBuf>,
        /// SQLite checkpoint database; completed stages are resumed from it
        #[cfg(feature = "checkpoint")]
        #[arg(long)]
        checkpoint: Option<String>,
    },
    /// Remove lines that repeat anywhere in the corpus
    Lines {
        #[command(flatten)]
        io: IoArgs,
    },
    /// Print the MinHash signature and band keys of a text
    Signature {
        text: String,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Compare two texts: exact Jaccard, estimate, LSH candidacy
    Similarity {
        a: String,
        b: String,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Print the LSH S-curve for a banding scheme
    Scurve {
        /// Bands (0 = choose from threshold)
        #[arg(short, long, default_value_t = 0)]
        bands: usize,
        /// Rows per band (0 = choose from threshold)
        #[arg(short, long, default_value_t = 0)]
        rows: usize,
        #[arg(long, default_value_t = 128)]
        num_perm: usize,
        #[arg(short, long, default_value_t = 0.8)]
        threshold: f64,
        #[arg(long, default_value_t = 20)]
        steps: usize,
    },
    /// Inspect or clear a checkpoint database
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List stored checkpoints
    Info { db: String },
    /// Delete checkpoints (all stages unless --stage is given)
    Clear {
        db: String,
        /// exact, signatures or clusters
        #[arg(long)]
        stage: Option<String>,
    },
}

#[derive(Args)]
struct IoArgs {
    /// JSONL input file (default: stdin)
    #[arg(short, long, conflicts_with = "input_dir")]
    input: Option<PathBuf>,
    /// Directory of text files, one document per file
    #[arg(long)]
    input_dir: Option<PathBuf>,
    /// JSONL output file (default: stdout)
    #[arg(short, long, conflicts_with = "output_dir")]
    output: Option<PathBuf>,
    /// Write one text file per surviving document
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long, default_value = "id")]
    id_field: String,
    #[arg(long, default_value = "text")]
    text_field: String,
}

#[derive(Args)]
struct ConfigArgs {
    /// JSON config file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short = 'w', long)]
    shingle_width: Option<usize>,
    #[arg(short = 'k', long)]
    num_perm: Option<usize>,
    #[arg(long)]
    bands: Option<usize>,
    #[arg(long)]
    rows: Option<usize>,
    #[arg(short, long)]
    threshold: Option<f64>,
    #[arg(long)]
    max_bucket: Option<usize>,
    /// first_seen or longest
    #[arg(long)]
    policy: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
    /// none, signature or shingles
    #[arg(long)]
    verify: Option<String>,
    /// Run sharded with this many shards
    #[arg(long)]
    shards: Option<usize>,
    /// 64 or 128
    #[arg(long)]
    digest_bits: Option<u32>,
    #[arg(long)]
    strip_punctuation: bool,
    #[arg(long)]
    keep_case: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // ── MCP server mode ─────────────────────────────────────────────────
    #[cfg(feature = "mcp")]
    if cli.mcp {
        let rt = tokio::runtime::Runtime::new().unwrap_or_else(|e| fail(format!("failed to create tokio runtime: {e}")));
        rt.block_on(async {
            if let Err(e) = corpus_dedup::mcp::serve_stdio().await {
                eprintln!("MCP server error: {e}");
                std::process::exit(1);
            }
        });
        return;
    }

    // ── Normal subcommand dispatch ──────────────────────────────────────
    let command = cli.command.unwrap_or_else(|| {
        eprintln!("No subcommand provided. Run `corpus-dedup --help` for usage.");
        std::process::exit(1);
    });

    match command {
        Commands::Run {
            io,
            config,
            stats,
            #[cfg(feature = "checkpoint")]
            checkpoint,
        } => {
            #[cfg(feature = "checkpoint")]
            let checkpoint = checkpoint.as_deref();
            #[cfg(not(feature = "checkpoint"))]
            let checkpoint: Option<&str> = None;
            cmd_run(&io, build_config(&config), stats, checkpoint)
        }
        Commands::Lines { io } => cmd_lines(&io),
        Commands::Signature { text, config } => {
            print_json(ops::op_signature(&text, build_config(&config)))
        }
        Commands::Similarity { a, b, config } => {
            print_json(ops::op_similarity(&a, &b, build_config(&config)))
        }
        Commands::Scurve {
            bands,
            rows,
            num_perm,
            threshold,
            steps,
        } => print_json(ops::op_scurve(bands, rows, num_perm, threshold, steps)),
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Info { db } => print_json(ops::op_checkpoint_info(&db)),
            CheckpointAction::Clear { db, stage } => {
                print_json(ops::op_checkpoint_clear(&db, stage.as_deref()))
            }
        },
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn fail(msg: impl Display) -> ! {
    eprintln!("Error: {msg}");
    std::process::exit(1);
}

fn print_json(result: Result<Value, String>) {
    match result {
        Ok(v) => println!(
            "{}",
            serde_json::to_string_pretty(&v).unwrap_or_else(|e| fail(e))
        ),
        Err(e) => fail(e),
    }
}

fn build_config(args: &ConfigArgs) -> DedupConfig {
    let mut cfg = match &args.config {
        Some(path) => DedupConfig::load(path).unwrap_or_else(|e| fail(e)),
        None => DedupConfig::default(),
    };
    if let Some(w) = args.shingle_width {
        cfg.shingle_width = w;
    }
    if let Some(k) = args.num_perm {
        cfg.num_hash_functions = k;
        // A new k invalidates the configured split unless it is also given.
        if args.bands.is_none() && args.rows.is_none() {
            cfg.num_bands = 0;
            cfg.rows_per_band = 0;
        }
    }
    if let Some(b) = args.bands {
        cfg.num_bands = b;
    }
    if let Some(r) = args.rows {
        cfg.rows_per_band = r;
    }
    if let Some(t) = args.threshold {
        cfg.similarity_threshold = t;
    }
    if let Some(m) = args.max_bucket {
        cfg.max_bucket_size = m;
    }
    if let Some(p) = &args.policy {
        cfg.representative_policy = RepresentativePolicy::from_str(p)
            .unwrap_or_else(|| fail(format!("Unknown policy '{p}'. Use: first_seen, longest")));
    }
    if let Some(s) = args.seed {
        cfg.random_seed = s;
    }
    if let Some(v) = &args.verify {
        cfg.verify = VerifyMode::from_str(v)
            .unwrap_or_else(|| fail(format!("Unknown verify mode '{v}'. Use: none, signature, shingles")));
    }
    if let Some(n) = args.shards {
        cfg.execution = ExecutionMode::Sharded { shards: n };
    }
    if let Some(bits) = args.digest_bits {
        cfg.digest_bits = bits;
    }
    if args.strip_punctuation {
        cfg.normalize.strip_punctuation = true;
    }
    if args.keep_case {
        cfg.normalize.lowercase = false;
    }
    cfg
}

fn open_source(io_args: &IoArgs) -> Box<dyn DocumentSource> {
    let fields = RecordFields {
        id: io_args.id_field.clone(),
        text: io_args.text_field.clone(),
    };
    if let Some(dir) = &io_args.input_dir {
        return Box::new(TextDirSource::new(dir));
    }
    match &io_args.input {
        Some(path) => Box::new(JsonlSource::new(path, fields)),
        // stdin cannot be re-read, so it is buffered once.
        None => Box::new(
            MemorySource::from_jsonl_reader(io::stdin().lock(), &fields).unwrap_or_else(|e| fail(e)),
        ),
    }
}

fn open_sink(io_args: &IoArgs) -> Box<dyn DocumentSink> {
    if let Some(dir) = &io_args.output_dir {
        return Box::new(TextDirSink::create(dir).unwrap_or_else(|e| fail(e)));
    }
    match &io_args.output {
        Some(path) => Box::new(JsonlFileSink::create(path).unwrap_or_else(|e| fail(e))),
        None => Box::new(JsonlWriterSink::new(io::stdout().lock())),
    }
}

fn cmd_run(io_args: &IoArgs, config: DedupConfig, stats_path: Option<PathBuf>, checkpoint: Option<&str>) {
    let pipeline = Pipeline::new(config).unwrap_or_else(|e| fail(e));
    let source = open_source(io_args);

    #[cfg(feature = "checkpoint")]
    let store = checkpoint.map(|path| SqliteStore::open_or_create(path).unwrap_or_else(|e| fail(e)));
    #[cfg(feature = "checkpoint")]
    let pipeline = match &store {
        Some(db) => pipeline.with_checkpoints(db),
        None => pipeline,
    };
    #[cfg(not(feature = "checkpoint"))]
    let _ = checkpoint;

    let plan = pipeline
        .run(source.as_ref(), open_sink(io_args))
        .unwrap_or_else(|e| fail(e));

    let report = serde_json::to_string_pretty(&plan.stats).unwrap_or_else(|e| fail(e));
    match stats_path {
        Some(path) => std::fs::write(&path, report).unwrap_or_else(|e| fail(e)),
        None => eprintln!("{report}"),
    }
}

fn cmd_lines(io_args: &IoArgs) {
    let source = open_source(io_args);
    let stats = pipeline::dedup_lines(source.as_ref(), open_sink(io_args)).unwrap_or_else(|e| fail(e));
    eprintln!(
        "{}",
        serde_json::to_string_pretty(&stats).unwrap_or_else(|e| fail(e))
    );
}
