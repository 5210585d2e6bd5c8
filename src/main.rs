use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use simcull::config::Settings;
use simcull::core::ledger::{LedgerFile, ReversalStatus, reverse_all};
use simcull::core::store;
use simcull::core::triage::Triage;
use simcull::core::vision::Method;
use simcull::services::{self, ScanRequest, SortKey};

#[derive(Parser, Debug)]
#[command(name = "simcull", version, about = "Find visually duplicate images and cull them reversibly")]
struct Cli {
    /// Settings file (default: <config dir>/simcull/config.json)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Cluster similar images and write a result store
    Scan {
        /// Directory to scan
        #[arg(value_name = "DIR")]
        path: PathBuf,
        /// Separate tree whose files act as pivots
        #[arg(short, long, value_name = "DIR")]
        target: Option<PathBuf>,
        /// Result store (default: `<DIR>/simcull_<name>.jsonl`)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
        /// Failure list (default: `<DIR>/failed_<name>.json`)
        #[arg(short, long, value_name = "FILE")]
        failed: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value_t = Method::PHash)]
        method: Method,
        /// Maximum signature distance, in the method's units
        #[arg(long)]
        threshold: Option<f64>,
        /// Maximum difference of height/width ratios
        #[arg(long)]
        aspect_tolerance: Option<f64>,
        /// File suffixes to include, e.g. `-e jpg -e .png`
        #[arg(short, long = "ext", value_name = "EXT")]
        extensions: Vec<String>,
    },

    /// Summarize a result store
    Report {
        #[arg(value_name = "STORE")]
        store: PathBuf,
        #[arg(short = 'k', long, value_enum, default_value_t = SortKey::Count)]
        sort: SortKey,
    },

    /// Review clusters and move unwanted files aside
    Triage {
        #[arg(value_name = "STORE")]
        store: PathBuf,
        /// Where moved files go (default: `<source>/output`)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
        /// Move ledger (default: `<output>/record.txt`)
        #[arg(short, long = "record", value_name = "FILE")]
        record: Option<PathBuf>,
    },

    /// Put back every move recorded in a ledger
    Undo {
        #[arg(value_name = "LEDGER")]
        ledger: PathBuf,
    },

    /// Print the distance of every pivot/candidate pair
    Distances {
        #[arg(value_name = "DIR")]
        path: PathBuf,
        #[arg(short, long, value_name = "DIR")]
        target: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value_t = Method::PHash)]
        method: Method,
    },

    /// Show the effective method table
    Config,
}

fn progress_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
        )?
        .progress_chars("█▓▒░  "),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    match cli.command {
        Commands::Scan {
            path,
            target,
            output,
            failed,
            method,
            threshold,
            aspect_tolerance,
            extensions,
        } => {
            let extensions = if extensions.is_empty() {
                settings.extensions.clone()
            } else {
                extensions
            };
            let params = settings.params_for(method, threshold, aspect_tolerance);

            let mut request = ScanRequest::new(&path, method, params, extensions);
            request.target = target;
            if let Some(output) = output {
                request.store_path = output;
            }
            if let Some(failed) = failed {
                request.failed_path = failed;
            }

            println!(
                "▶ Scanning {} with {} (threshold {}, aspect tolerance {})",
                path.display(),
                method,
                params.threshold,
                params.aspect_tolerance
            );
            let pb = progress_bar()?;
            let summary = services::run_scan(&request, &pb)
                .with_context(|| format!("Scan of {} failed", path.display()))?;
            pb.finish_and_clear();

            println!(
                "✅ {} files, {} cluster(s) written to {}",
                summary.files,
                summary.clusters,
                summary.store.display()
            );
            if let Some(failed) = &summary.failed_list {
                println!(
                    "⚠️  {} file(s) failed, listed in {}",
                    summary.failures,
                    failed.display()
                );
            }

            let run = store::load(&summary.store)?;
            print!("\n{}", services::summarize(&run, SortKey::Count));
        }

        Commands::Report { store, sort } => {
            let run = store::load(&store)
                .with_context(|| format!("Could not read store {}", store.display()))?;
            print!("{}", services::summarize(&run, sort));
        }

        Commands::Triage {
            store,
            output,
            record,
        } => {
            let run = store::load(&store)
                .with_context(|| format!("Could not read store {}", store.display()))?;
            let output = output.unwrap_or_else(|| run.header.source.join("output"));
            let record = record.unwrap_or_else(|| output.join("record.txt"));

            let mut triage = Triage::open(run.clusters, &output, LedgerFile::new(&record))
                .context("Could not start triage")?;
            println!(
                "▶ {} active cluster(s); moves go to {}, recorded in {}",
                triage.active().len(),
                output.display(),
                record.display()
            );

            let summary = services::run_session(&mut triage, &run.header.source, &run.stats)?;
            println!(
                "\n✅ Moved {} file(s), undid {}. Ledger: {}",
                summary.moved,
                summary.undone,
                record.display()
            );
        }

        Commands::Undo { ledger } => {
            let ledger = LedgerFile::new(ledger);
            let reversals = reverse_all(&ledger)
                .with_context(|| format!("Could not reverse {}", ledger.path().display()))?;
            if reversals.is_empty() {
                println!("Nothing recorded in {}", ledger.path().display());
            }

            let mut failed = 0;
            for reversal in &reversals {
                let line = &reversal.line;
                match &reversal.status {
                    ReversalStatus::Restored => println!(
                        "🔄 [{}] Restored {} → {}",
                        reversal.index,
                        line.destination.display(),
                        line.source.display()
                    ),
                    ReversalStatus::Missing => println!(
                        "⚠️  [{}] {} does not exist; skipping",
                        reversal.index,
                        line.destination.display()
                    ),
                    ReversalStatus::Failed(reason) => {
                        failed += 1;
                        eprintln!(
                            "❌ [{}] Could not restore {}: {}",
                            reversal.index,
                            line.destination.display(),
                            reason
                        );
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} move(s) could not be reversed and remain in the ledger");
            }
        }

        Commands::Distances {
            path,
            target,
            method,
        } => {
            let pb = progress_bar()?;
            let pairs = services::measure_distances(
                &path,
                target.as_deref(),
                method,
                &settings.extensions,
                &pb,
            )?;
            pb.finish_and_clear();

            println!("Distances in {}:", method.scale());
            for pair in pairs {
                let distance = pair
                    .distance
                    .map_or_else(|| "n/a".to_string(), |d| format!("{d:.4}"));
                println!(
                    "{:>10}  {} ↔ {}",
                    distance,
                    pair.pivot.display(),
                    pair.other.display()
                );
            }
        }

        Commands::Config => {
            println!("{settings}");
        }
    }

    Ok(())
}
