mod classify;
mod dates;
mod error;
mod extract;
mod headers;
mod models;
mod oracle;
mod pipeline;
mod report;
mod resolver;
mod settings;
mod sheet;
mod unmatched;
mod watcher;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::watcher::{SystemClock, Watcher};

#[derive(Parser)]
#[command(
    name = "ledgerwatch",
    about = "Watched-folder ledger ingestion, name resolution and reporting."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the watch/output/archive/dictionary folders and a default settings file.
    Init {
        /// Folder to watch for ledger uploads (default: ~/Documents/帳簿アップロード)
        #[arg(long = "watch-dir")]
        watch_dir: Option<String>,
    },
    /// Watch the upload folder and process files until stopped.
    Watch,
    /// Push a single ledger file through the pipeline and archive it.
    Process {
        /// Path to a 部署_企業_YYYY年M月 ledger file
        file: PathBuf,
    },
    /// Regenerate the company-wide rollup immediately.
    Merge,
}

fn run_init(watch_dir: Option<String>) -> Result<()> {
    let mut settings = settings::load_settings();
    if let Some(dir) = watch_dir {
        settings.watch_dir = dir;
    }
    settings.ensure_dirs()?;
    settings::save_settings(&settings)?;
    println!("watching       {}", settings.watch_dir().display());
    println!("output         {}", settings.output_dir().display());
    println!("archive        {}", settings.archive_dir().display());
    println!("dictionaries   {}", settings.dict_dir().display());
    Ok(())
}

fn run_watch() -> Result<()> {
    let settings = settings::load_settings();
    let mut pipeline = Pipeline::new(settings.clone())?;
    let stop = Arc::new(AtomicBool::new(false));

    let merge_handle = watcher::spawn_merge_task(settings, Arc::clone(&stop));

    let clock = SystemClock;
    let mut watcher = Watcher::new(&clock);
    watcher.run(&mut pipeline, &stop);

    let _ = merge_handle.join();
    Ok(())
}

fn run_process(file: &PathBuf) -> Result<()> {
    let settings = settings::load_settings();
    let mut pipeline = Pipeline::new(settings.clone())?;
    match pipeline.process_file(file) {
        Ok(count) => {
            watcher::archive_file(file, &settings, true);
            println!("{} records extracted", count);
            Ok(())
        }
        Err(e) => {
            watcher::archive_file(file, &settings, false);
            Err(e)
        }
    }
}

fn run_merge() -> Result<()> {
    let settings = settings::load_settings();
    settings.ensure_dirs()?;
    report::merge_all(&settings.output_dir())?;
    println!("company rollup regenerated");
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init { watch_dir } => run_init(watch_dir),
        Commands::Watch => run_watch(),
        Commands::Process { file } => run_process(&file),
        Commands::Merge => run_merge(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
