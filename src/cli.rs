use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};

use crate::commands::{
    self, CommandReport, analyze::AnalyzeOptions, chunk::ChunkOptions, extract::ExtractOptions,
    results::ResultsOptions, threads::ThreadsOptions,
};

#[derive(Parser)]
#[command(
    name = "chatlens",
    version,
    about = "Analyze exported chat logs with an LLM and aggregate the insights"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract threads from an exported chat file into permanent storage
    Extract {
        /// Path to the exported JSON chat file
        file: PathBuf,
        /// Reuse an existing session id instead of generating one
        #[arg(long)]
        session: Option<String>,
    },
    /// Analyze a batch of unanalyzed threads and fold them into the report
    Analyze {
        /// How many threads to analyze (default from config)
        #[arg(long)]
        count: Option<usize>,
        /// Use the built-in mock backend instead of the real API
        #[arg(long)]
        mock: bool,
        /// API key override (falls back to CHATLENS_API_KEY / ANTHROPIC_API_KEY)
        #[arg(long)]
        api_key: Option<String>,
        /// Session id to record in the analysis metadata
        #[arg(long)]
        session: Option<String>,
        /// Source filename to record in the analysis metadata
        #[arg(long)]
        filename: Option<String>,
    },
    /// Split a text file into analysis-sized chunks
    Chunk {
        file: PathBuf,
        /// Chunk budget in bytes (default from config)
        #[arg(long)]
        max_size: Option<usize>,
        /// Keep at most this many chunks (0 = all)
        #[arg(long)]
        max_chunks: Option<usize>,
        /// Write chunk_{i}.txt files into this directory
        #[arg(long)]
        output: Option<PathBuf>,
        /// Analyze the chunks and save the combined report
        #[arg(long)]
        analyze: bool,
        /// Use the deterministic mock backend instead of the API
        #[arg(long)]
        mock: bool,
        /// API key override (falls back to CHATLENS_API_KEY / ANTHROPIC_API_KEY)
        #[arg(long)]
        api_key: Option<String>,
    },
    /// List stored threads, newest first
    Threads {
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 10)]
        per_page: usize,
    },
    /// Show a stored thread's transcript
    Thread { id: String },
    /// Show the latest combined analysis
    Results {
        /// Only include threads at or after this date/time
        #[arg(long)]
        start: Option<String>,
        /// Only include threads at or before this date/time
        #[arg(long)]
        end: Option<String>,
        /// Emit the full combined analysis as JSON
        #[arg(long)]
        json: bool,
    },
    /// List stored threads that are evidence for a combined insight
    Evidence { insight: String },
    /// Show storage paths and analysis statistics
    Status,
    /// Clear analysis state while keeping stored threads
    Reset,
}

fn print_report(report: &CommandReport) -> Result<()> {
    for detail in &report.details {
        println!("{detail}");
    }
    for issue in &report.issues {
        eprintln!("{}: {issue}", report.command);
    }
    if !report.ok {
        bail!("{} failed", report.command);
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let report = match cli.command {
        Command::Extract { file, session } => {
            commands::extract::run(&ExtractOptions { file, session })?
        }
        Command::Analyze {
            count,
            mock,
            api_key,
            session,
            filename,
        } => commands::analyze::run(&AnalyzeOptions {
            count,
            mock,
            api_key,
            session,
            filename,
        })?,
        Command::Chunk {
            file,
            max_size,
            max_chunks,
            output,
            analyze,
            mock,
            api_key,
        } => commands::chunk::run(&ChunkOptions {
            file,
            max_size,
            max_chunks,
            output,
            analyze,
            mock,
            api_key,
        })?,
        Command::Threads { page, per_page } => {
            commands::threads::run(&ThreadsOptions { page, per_page })?
        }
        Command::Thread { id } => commands::show_thread::run(&id)?,
        Command::Results { start, end, json } => {
            commands::results::run(&ResultsOptions { start, end, json })?
        }
        Command::Evidence { insight } => commands::evidence::run(&insight)?,
        Command::Status => commands::status::run()?,
        Command::Reset => commands::reset::run()?,
    };

    print_report(&report)
}
