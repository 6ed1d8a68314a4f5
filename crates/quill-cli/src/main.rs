//! quill CLI — inspect, edit, and sync a correction store.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use quill_core::merge::merge_records;
use quill_core::object::ObjectCache;
use quill_core::repo::{CommitDetails, CorrectionKind, CorrectionQuery, CorrectionRepository};
use quill_core::sync::{open_or_clone, RefOutcome, SyncDriver};
use quill_core::worker::{BackgroundLoop, StoreState};
use quill_core::{schema, Review, StoreConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quill", about = "quill — git-backed correction store", version)]
struct Cli {
    /// Working copy of the store (cloned on `sync` when missing).
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Config file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = quill_core::config::CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Exchange the branch and all correction refs with the remote.
    Sync {
        /// Output format: "human" (default) or "json".
        #[arg(long, default_value = "human")]
        format: String,
    },

    /// List tracked files and whether they have a correction.
    Files {
        /// Output format: "human" (default) or "json".
        #[arg(long, default_value = "human")]
        format: String,
    },

    /// Show the correction of a file.
    Show {
        path: String,

        /// Steps back along the correction chain.
        #[arg(long, default_value = "0")]
        depth: usize,

        /// Which chain: "local" (default), "remote", or "common-parent".
        #[arg(long, default_value = "local")]
        kind: String,

        /// Output format: "human" (default), "json", or "text".
        #[arg(long, default_value = "human")]
        format: String,
    },

    /// Whether a file had a correction `depth` commits before the tip.
    Has {
        path: String,

        #[arg(long, default_value = "0")]
        depth: usize,
    },

    /// How many commits back the newest correction of a file is.
    Depth { path: String },

    /// Print a tracked file at the branch tip.
    Text { path: String },

    /// Show the branch tip.
    Head,

    /// Add a word to the user dictionary.
    AddWord { word: String },

    /// Replace a tracked file's content and commit it to the branch.
    SetText {
        path: String,

        /// File holding the new content.
        #[arg(long)]
        from: PathBuf,

        #[arg(long, short)]
        message: String,
    },

    /// Store a review (JSON file) for the current content of a file.
    Review {
        path: String,

        /// File holding the review as JSON.
        #[arg(long)]
        from: PathBuf,
    },

    /// Print one review, or every review when no id is given.
    Reviews { id: Option<String> },

    /// Print a stored record (either schema) in the current schema.
    Migrate { file: PathBuf },

    /// Three-way merge of record files; conflicts are reported on stderr.
    Merge {
        ancestor: PathBuf,
        local: PathBuf,
        remote: PathBuf,
    },

    /// Run the background loop.
    Watch {
        /// Stop after this many passes.
        #[arg(long)]
        passes: Option<usize>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Commands::Migrate { file } => cmd_migrate(&file),
        Commands::Merge {
            ancestor,
            local,
            remote,
        } => cmd_merge(&ancestor, &local, &remote),
        command => StoreConfig::load(&cli.config)
            .map_err(Into::into)
            .and_then(|config| run(&cli.repo, &config, command)),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(root: &Path, config: &StoreConfig, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    if let Commands::Sync { format } = &command {
        return cmd_sync(root, config, format);
    }

    let repo = CorrectionRepository::open(root, config)?;
    match command {
        Commands::Files { format } => cmd_files(&repo, &format),
        Commands::Show {
            path,
            depth,
            kind,
            format,
        } => cmd_show(&repo, &path, depth, &kind, &format),
        Commands::Has { path, depth } => {
            println!("{}", repo.has_correction(&path, depth)?);
            Ok(())
        }
        Commands::Depth { path } => {
            match repo.latest_correction_depth(&path)? {
                Some(depth) => println!("{depth}"),
                None => println!("no correction"),
            }
            Ok(())
        }
        Commands::Text { path } => {
            print!("{}", repo.get_text(&path)?);
            Ok(())
        }
        Commands::Head => {
            println!("{}", serde_json::to_string_pretty(&repo.current_commit()?)?);
            Ok(())
        }
        Commands::AddWord { word } => {
            if repo.add_word_to_dictionary(&word)? {
                println!("added '{}'", word.trim());
            } else {
                println!("'{}' already in dictionary", word.trim());
            }
            Ok(())
        }
        Commands::SetText { path, from, message } => {
            let text = fs::read_to_string(&from)?;
            let tip = repo.set_text(&path, &text, &CommitDetails::message(message))?;
            println!("{path} -> {tip}");
            Ok(())
        }
        Commands::Review { path, from } => {
            let review: Review = serde_json::from_slice(&fs::read(&from)?)?;
            println!("{}", repo.add_review(&path, review)?);
            Ok(())
        }
        Commands::Reviews { id: Some(id) } => {
            println!("{}", serde_json::to_string_pretty(&repo.get_review(&id)?)?);
            Ok(())
        }
        Commands::Reviews { id: None } => {
            println!("{}", serde_json::to_string_pretty(&repo.list_reviews()?)?);
            Ok(())
        }
        Commands::Watch { passes } => cmd_watch(&repo, config, passes),
        Commands::Sync { .. } | Commands::Migrate { .. } | Commands::Merge { .. } => Ok(()),
    }
}

fn cmd_sync(root: &Path, config: &StoreConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let repo = open_or_clone(root, config)?;
    let report = SyncDriver::new(&repo).sync()?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("branch: {:?}", report.branch);
    if report.refs.is_empty() {
        println!("corrections: up to date");
    }
    for r in &report.refs {
        let short = &r.spellcheck_id[..r.spellcheck_id.len().min(12)];
        match &r.outcome {
            RefOutcome::Merged { conflicts } => {
                println!("  merged  {short} ({} conflict(s))", conflicts.len());
                for c in conflicts {
                    println!("          paragraph {} {} ({:?})", c.paragraph, c.field, c.resolution);
                }
            }
            RefOutcome::Failed { reason } => println!("  failed  {short}: {reason}"),
            other => println!("  {:<7} {short}", format!("{other:?}").to_lowercase()),
        }
    }
    if report.failed() > 0 {
        return Err(format!("{} correction(s) could not be merged", report.failed()).into());
    }
    Ok(())
}

fn cmd_files(repo: &CorrectionRepository, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let files = repo.list_files()?;
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }
    for f in &files {
        let marker = if f.has_correction { "*" } else { " " };
        println!("{marker} {}", f.path);
    }
    Ok(())
}

fn cmd_show(
    repo: &CorrectionRepository,
    path: &str,
    depth: usize,
    kind: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let kind = match kind {
        "local" => CorrectionKind::Local,
        "remote" => CorrectionKind::Remote,
        "common-parent" => CorrectionKind::CommonParent,
        other => return Err(format!("unknown kind '{other}'").into()),
    };
    let query = CorrectionQuery::path(path).kind(kind).depth(depth);
    let mut cache = ObjectCache::new();
    let files = repo.get_correction_files(&query, &mut cache)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&files.metadata)?),
        "text" => print!("{}", files.correction),
        _ => {
            let (done, total) = files.metadata.progress();
            println!("correction of {path}");
            println!("  progress: {done}/{total} paragraph(s)");
            println!("  time:     {} ms", files.metadata.time_spent_ms);
            for (i, p) in files.metadata.paragraph_info.iter().enumerate() {
                let models: Vec<&str> = p.judgment.keys().map(String::as_str).collect();
                let grammar = p
                    .corrected
                    .as_ref()
                    .map(|c| c.corrections.len())
                    .unwrap_or(0);
                println!(
                    "  [{i}] {} grammar hit(s), models: {}",
                    grammar,
                    if models.is_empty() { "-".to_string() } else { models.join(", ") }
                );
            }
        }
    }
    Ok(())
}

fn cmd_migrate(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let record = schema::parse_record(&fs::read(file)?)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn cmd_merge(ancestor: &Path, local: &Path, remote: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let ancestor = schema::parse_record(&fs::read(ancestor)?)?;
    let local = schema::parse_record(&fs::read(local)?)?;
    let remote = schema::parse_record(&fs::read(remote)?)?;
    let outcome = merge_records(&ancestor, &local, &remote)?;
    for c in &outcome.conflicts {
        eprintln!("conflict: paragraph {} {} ({:?})", c.paragraph, c.field, c.resolution);
    }
    println!("{}", serde_json::to_string_pretty(&outcome.record)?);
    Ok(())
}

fn cmd_watch(
    repo: &CorrectionRepository,
    config: &StoreConfig,
    passes: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = StoreState::new(config.clone());
    // Correction phases are supplied by embedders; from the CLI the loop
    // only keeps the store in sync.
    BackgroundLoop::new(&state, repo).run(passes)?;
    Ok(())
}
