//! Bulk-loads ham/spam/stop-word/ignored-word files straight into the
//! database, bypassing the on-startup directory scan. Useful for seeding a
//! fresh deployment or refreshing the preset sets offline.
//!
//! ./import-samples --dsn sqlite:state.db --gid default spam.txt ham.txt

use std::{fs, path::PathBuf};

use clap::Parser;
use groupguard::storage::dictionary::{DictionaryStore, DictionaryType};
use groupguard::storage::samples::{SampleOrigin, SampleType, SamplesStore};
use groupguard::storage::Engine;

#[derive(Parser, Debug)]
#[command(name = "import-samples", about = "Bulk-load sample/dictionary files into the database")]
struct Args {
    #[arg(long, env = "DATABASE_URL")]
    dsn: String,

    #[arg(long, default_value = "default")]
    gid: String,

    /// Replace the existing preset set for each file's kind instead of merging.
    #[arg(long)]
    replace: bool,

    /// Files named spam.txt / ham.txt / stop_words.txt / ignored_words.txt;
    /// anything else is rejected with an error naming the file.
    files: Vec<PathBuf>,
}

fn kind_for(path: &PathBuf) -> anyhow::Result<&'static str> {
    match path.file_name().and_then(|n| n.to_str()) {
        Some("spam.txt") => Ok("spam"),
        Some("ham.txt") => Ok("ham"),
        Some("stop_words.txt") => Ok("stop_words"),
        Some("ignored_words.txt") => Ok("ignored_words"),
        _ => Err(anyhow::anyhow!(
            "{}: file name must be one of spam.txt, ham.txt, stop_words.txt, ignored_words.txt",
            path.display()
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.files.is_empty() {
        anyhow::bail!("no input files given");
    }

    let engine = Engine::open(&args.dsn, args.gid.clone()).await?;
    let samples = SamplesStore::new(engine.clone()).await?;
    let dictionary = DictionaryStore::new(engine).await?;

    for path in &args.files {
        let kind = kind_for(path)?;
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;

        match kind {
            "spam" => {
                let stats = samples.import(SampleType::Spam, SampleOrigin::Preset, &content, args.replace).await?;
                println!("{}: {} spam samples loaded", path.display(), stats.preset_spam);
            }
            "ham" => {
                let stats = samples.import(SampleType::Ham, SampleOrigin::Preset, &content, args.replace).await?;
                println!("{}: {} ham samples loaded", path.display(), stats.preset_ham);
            }
            "stop_words" => {
                let stats = dictionary.import(DictionaryType::StopPhrase, &content, args.replace).await?;
                println!("{}: {} stop phrases loaded", path.display(), stats.total_stop_phrases);
            }
            "ignored_words" => {
                let stats = dictionary.import(DictionaryType::IgnoredWord, &content, args.replace).await?;
                println!("{}: {} ignored words loaded", path.display(), stats.total_ignored_words);
            }
            _ => unreachable!(),
        }
    }

    Ok(())
}
