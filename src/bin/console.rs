//! Text-mode conversation console.
//!
//! Lines typed on stdin stand in for recognized speech and spoken replies are
//! printed to stdout, paced like real playback. Typing while a reply is
//! "playing" barges in. Tracing goes to stderr.
//!
//! Usage: `parley-console [--config <file.toml>] [--knowledge <docs.jsonl>]`

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parley::config::AgentConfig;
use parley::pipeline::Backends;
use parley::retrieval::{Document, EmbeddingProvider, HttpEmbeddingProvider, InMemoryVectorStore};
use parley::stt::{RecognizerEvent, RecognizerSettings, RecognizerSink, SpeechRecognizer};
use parley::tts::SpeechSynthesizer;
use parley::tts::ssml::strip_markup;
use parley::{AgentError, VoiceAgent};
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Simulated playback pace.
const MS_PER_WORD: u64 = 250;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    knowledge: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config needs a path"))?;
                args.config = Some(PathBuf::from(path));
            }
            "--knowledge" | "-k" => {
                let path = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--knowledge needs a path"))?;
                args.knowledge = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                println!("usage: parley-console [--config <file.toml>] [--knowledge <docs.jsonl>]");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    let path = args
        .config
        .clone()
        .unwrap_or_else(AgentConfig::default_config_path);
    let mut config = if path.exists() {
        AgentConfig::from_file(&path)?
    } else if args.config.is_some() {
        anyhow::bail!("config file not found: {}", path.display());
    } else {
        AgentConfig::default()
    };
    config.apply_env_overrides();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    config.validate()?;

    let store = Arc::new(InMemoryVectorStore::new());
    if let Some(knowledge) = &args.knowledge {
        let embedder = HttpEmbeddingProvider::new(config.embedding.clone());
        let loaded = load_knowledge(knowledge.clone(), embedder, Arc::clone(&store)).await?;
        info!("loaded {loaded} knowledge document(s) from {}", knowledge.display());
    }

    let backends = Backends::http(
        &config,
        Arc::new(LineRecognizer::default()),
        Arc::new(ConsoleSynthesizer::default()),
        store,
    )?;
    let agent = VoiceAgent::new(config, backends)?;

    println!("Parley v{}", env!("CARGO_PKG_VERSION"));
    println!("Type to talk. Typing while the agent speaks interrupts it. Ctrl+C to quit.\n");

    let stats = agent.run().await?;
    println!("\n{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

// ── Knowledge loading ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct KnowledgeEntry {
    text: String,
    #[serde(default)]
    source: Option<String>,
}

/// Embed every JSONL entry into `store`. Malformed lines are skipped.
async fn load_knowledge(
    path: PathBuf,
    embedder: HttpEmbeddingProvider,
    store: Arc<InMemoryVectorStore>,
) -> anyhow::Result<usize> {
    let loaded = tokio::task::spawn_blocking(move || -> Result<usize, AgentError> {
        let content = std::fs::read_to_string(&path)?;
        let mut loaded = 0;
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: KnowledgeEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("{}:{}: skipping malformed entry: {e}", path.display(), n + 1);
                    continue;
                }
            };
            let embedding = embedder.embed(&entry.text)?;
            let mut document = Document::new(entry.text);
            if let Some(source) = entry.source {
                document = document.with_source(source);
            }
            store.insert(document, embedding);
            loaded += 1;
        }
        Ok(loaded)
    })
    .await??;
    Ok(loaded)
}

// ── Console speech adapters ───────────────────────────────────

/// Reads stdin lines on a plain thread, as a vendor SDK would deliver
/// recognition callbacks. Each line is reported as a partial, then final.
#[derive(Debug, Default)]
struct LineRecognizer {
    stopped: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl SpeechRecognizer for LineRecognizer {
    fn start(&self, _settings: &RecognizerSettings, sink: RecognizerSink) -> parley::Result<()> {
        let stopped = Arc::clone(&self.stopped);
        let paused = Arc::clone(&self.paused);
        std::thread::Builder::new()
            .name("console-input".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    if stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(line) = line else { break };
                    if line.trim().is_empty() || paused.load(Ordering::SeqCst) {
                        continue;
                    }
                    if !sink.partial(line.clone()) || !sink.final_text(line, Some(1.0)) {
                        break;
                    }
                }
                let _ = sink.push(RecognizerEvent::SessionStopped);
            })?;
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

/// Prints each chunk and holds it for a reading-speed delay.
#[derive(Debug, Default)]
struct ConsoleSynthesizer {
    aborted: Notify,
}

#[async_trait]
impl SpeechSynthesizer for ConsoleSynthesizer {
    async fn speak_markup(&self, markup: &str) -> parley::Result<()> {
        let text = strip_markup(markup);
        println!("agent: {text}");
        let words = u64::try_from(text.split_whitespace().count()).unwrap_or(u64::MAX);
        let playback = Duration::from_millis(words.saturating_mul(MS_PER_WORD));
        tokio::select! {
            () = tokio::time::sleep(playback) => Ok(()),
            () = self.aborted.notified() => {
                println!("agent: [interrupted]");
                Err(AgentError::Tts("playback aborted".into()))
            }
        }
    }

    fn abort(&self) {
        self.aborted.notify_waiters();
    }
}
