use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use kisekae_engine::{
    BatchRequest, BatchRunner, EventsTarget, FetchConfig, HttpFetcher, ReplicateConfig,
    ReplicateEditor, RunOptions,
};
use serde_json::json;

const DEFAULT_PROMPT: &str = "Replace her outfit with a beige knit sweater and wide black trousers. \
     Keep hair, face, and background unchanged. Make the clothing fit naturally.";

#[derive(Debug, Parser)]
#[command(name = "kisekae", version, about = "Batch image editing through a remote generative service")]
struct Cli {
    /// Images to edit, processed in the order given.
    #[arg(long = "image", required = true)]
    images: Vec<PathBuf>,

    /// Edit instruction sent to the service.
    #[arg(long, default_value = DEFAULT_PROMPT)]
    prompt: String,

    /// Reference outfit images. Their presence augments the prompt; the
    /// files themselves are not uploaded.
    #[arg(long = "reference")]
    references: Vec<PathBuf>,

    /// Directory that receives one timestamped session folder per run.
    #[arg(long, default_value = "outputs")]
    save_dir: PathBuf,

    /// Keep results remote only; skip saving artifacts to disk.
    #[arg(long)]
    no_save: bool,

    /// Bundle saved artifacts into <session>_results.zip.
    #[arg(long)]
    zip: bool,

    /// Events log destination (default: events.jsonl inside the session
    /// directory when saving is enabled).
    #[arg(long)]
    events: Option<PathBuf>,

    /// Emit the run outcome as JSON on stdout.
    #[arg(long)]
    json: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("kisekae error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    for path in cli.images.iter().chain(cli.references.iter()) {
        if !path.is_file() {
            bail!("input image not found: {}", path.display());
        }
    }

    let editor = ReplicateEditor::new(ReplicateConfig::from_env()?)?;
    let fetcher = HttpFetcher::new(FetchConfig::default())?;
    let events = match (&cli.events, cli.no_save) {
        (Some(path), _) => EventsTarget::Path(path.clone()),
        (None, false) => EventsTarget::SessionDir,
        (None, true) => EventsTarget::Disabled,
    };
    let runner = BatchRunner::new(Box::new(editor), Box::new(fetcher)).with_events(events);

    let batch = BatchRequest {
        inputs: cli.images.clone(),
        prompt: cli.prompt.clone(),
        reference_images: cli.references.clone(),
        options: RunOptions {
            autosave: !cli.no_save,
            save_dir: cli.save_dir.clone(),
            make_archive: cli.zip,
        },
    };

    let total = batch.inputs.len();
    let mut progress = |fraction: f64, desc: &str| {
        if fraction >= 1.0 {
            eprintln!("[{total}/{total}] {desc}");
        } else {
            let step = (fraction * total as f64).round() as usize + 1;
            eprintln!("[{step}/{total}] {desc}");
        }
    };
    let outcome = runner.run(&batch, &mut progress)?;

    if cli.json {
        let payload = json!({
            "session": outcome.session.as_ref().map(|session| json!({
                "timestamp": session.timestamp(),
                "dir": session.dir().to_string_lossy(),
            })),
            "gallery_urls": outcome.gallery_urls,
            "log": outcome.log.lines(),
            "persisted": outcome.persisted,
            "archive": outcome.archive.as_ref().map(|path| path.to_string_lossy()),
            "cancelled": outcome.cancelled,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        if !outcome.gallery_urls.is_empty() {
            println!("Results:");
            for url in &outcome.gallery_urls {
                println!("  {url}");
            }
        }
        println!("{}", outcome.log.render());
    }

    Ok(0)
}
