use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use kindred_contracts::cache::GenerationCache;
use kindred_contracts::conversation::HostState;
use kindred_contracts::events::EventLog;
use kindred_contracts::features::{Feature, FeatureRegistry};
use kindred_contracts::settings::{ApiSettings, ENV_API_BASE, ENV_API_KEY, ENV_MODEL};
use kindred_engine::{ChatGateway, GenerateOptions, GenerationPipeline};

mod render;

#[derive(Debug, Parser)]
#[command(name = "kindred", version, about = "Kindred companion generation CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate one feature screen for a conversation.
    Generate(GenerateArgs),
    /// Show the cached payload for a pair without generating.
    Show(ShowArgs),
    /// List the available feature keys.
    Features,
    /// List the models the configured endpoint serves.
    Models(ModelsArgs),
    /// Drop cached payloads.
    CacheClear(CacheClearArgs),
    /// Report the effective configuration.
    Doctor(DoctorArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// Feature key, e.g. notes or screen-time.
    feature: String,
    /// Conversation id from the state file.
    conversation: String,
    #[arg(long)]
    state: PathBuf,
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long, default_value = "kindred_cache.json")]
    cache: PathBuf,
    #[arg(long, default_value = "kindred_events.jsonl")]
    events: PathBuf,
    /// Skip the cache and always call the model.
    #[arg(long)]
    force: bool,
    /// Recent-message window size.
    #[arg(long)]
    window: Option<usize>,
}

#[derive(Debug, Parser)]
struct ShowArgs {
    feature: String,
    conversation: String,
    #[arg(long)]
    state: PathBuf,
    #[arg(long, default_value = "kindred_cache.json")]
    cache: PathBuf,
}

#[derive(Debug, Parser)]
struct ModelsArgs {
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct CacheClearArgs {
    /// Feature key; requires a conversation too.
    feature: Option<String>,
    conversation: Option<String>,
    /// Drop every cached payload.
    #[arg(long)]
    all: bool,
    #[arg(long, default_value = "kindred_cache.json")]
    cache: PathBuf,
}

#[derive(Debug, Parser)]
struct DoctorArgs {
    #[arg(long)]
    settings: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("kindred error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Show(args) => run_show(args),
        Command::Features => run_features(),
        Command::Models(args) => run_models(args),
        Command::CacheClear(args) => run_cache_clear(args),
        Command::Doctor(args) => run_doctor(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let feature = parse_feature(&args.feature)?;
    let state = HostState::load(&args.state)?;
    let settings = ApiSettings::load(args.settings.as_deref())?;
    let pipeline = GenerationPipeline::new(
        ChatGateway::http(),
        settings,
        GenerationCache::new(&args.cache),
        EventLog::new(&args.events),
    );

    eprintln!("正在生成{}…", feature.title());
    let options = GenerateOptions {
        force_refresh: args.force,
        window: args.window,
        cancel: None,
    };
    let report = pipeline
        .generate(&state, feature, &args.conversation, &options)
        .with_context(|| format!("generation failed for {}", feature.key()))?;

    print!("{}", render::render_report(&report));
    Ok(0)
}

fn run_show(args: ShowArgs) -> Result<i32> {
    let feature = parse_feature(&args.feature)?;
    let state = HostState::load(&args.state)?;
    let character = state
        .conversation(&args.conversation)
        .map(|conversation| conversation.name.clone())
        .unwrap_or_else(|| {
            kindred_contracts::conversation::DEFAULT_CHARACTER_NAME.to_string()
        });

    let mut cache = GenerationCache::new(&args.cache);
    match cache.get(feature, &args.conversation, &character) {
        Some(entry) => {
            println!(
                "== {} (缓存于 {}) ==",
                feature.title(),
                entry.saved_at
            );
            if entry.fallback {
                println!("⚠ 占位内容，可重新生成。");
            }
            print!("{}", render::render_feature(feature, &entry.data));
            Ok(0)
        }
        None => {
            println!("{}暂无缓存，先运行 generate。", feature.title());
            Ok(2)
        }
    }
}

fn run_features() -> Result<i32> {
    let registry = FeatureRegistry::new();
    for feature in registry.list() {
        println!("{:<18} {}", feature.key(), feature.title());
    }
    Ok(0)
}

fn run_models(args: ModelsArgs) -> Result<i32> {
    let settings = ApiSettings::load(args.settings.as_deref())?;
    let gateway = ChatGateway::http();
    let models = gateway
        .fetch_models(&settings)
        .context("failed to list models")?;
    if models.is_empty() {
        println!("该端点未返回任何模型。");
        return Ok(2);
    }
    for model in models {
        println!("{model}");
    }
    Ok(0)
}

fn run_cache_clear(args: CacheClearArgs) -> Result<i32> {
    let mut cache = GenerationCache::new(&args.cache);
    if args.all {
        let removed = cache.clear_all()?;
        println!("已清除 {removed} 条缓存。");
        return Ok(0);
    }
    let (Some(feature), Some(conversation)) = (&args.feature, &args.conversation) else {
        bail!("pass a feature and a conversation, or --all");
    };
    let feature = parse_feature(feature)?;
    if cache.clear(feature, conversation)? {
        println!("已清除 {} / {} 的缓存。", feature.key(), conversation);
    } else {
        println!("没有匹配的缓存条目。");
    }
    Ok(0)
}

fn run_doctor(args: DoctorArgs) -> Result<i32> {
    let settings = ApiSettings::load(args.settings.as_deref())?;
    println!("endpoint: {}", or_unset(&settings.endpoint));
    println!("api_key:  {}", mask_secret(&settings.api_key));
    println!("model:    {}", or_unset(&settings.model));
    println!("temperature: {}", settings.temperature);
    println!("max_tokens: {}", settings.max_tokens);
    println!("timeout_seconds: {}", settings.timeout_seconds);
    println!(
        "min_request_interval_ms: {}",
        settings.min_request_interval_ms
    );
    for key in [ENV_API_BASE, ENV_API_KEY, ENV_MODEL] {
        let state = if std::env::var(key).map(|value| !value.trim().is_empty()) == Ok(true) {
            "set"
        } else {
            "unset"
        };
        println!("env {key}: {state}");
    }
    match settings.missing_field() {
        Some(field) => {
            println!("status: incomplete ({field} is empty)");
            Ok(2)
        }
        None => {
            println!("status: ready");
            Ok(0)
        }
    }
}

fn parse_feature(key: &str) -> Result<Feature> {
    match Feature::from_key(key) {
        Some(feature) => Ok(feature),
        None => {
            let known: Vec<&str> = Feature::all().iter().map(|feature| feature.key()).collect();
            bail!("unknown feature {key:?}; expected one of: {}", known.join(", "))
        }
    }
}

fn or_unset(value: &str) -> &str {
    if value.trim().is_empty() {
        "(unset)"
    } else {
        value
    }
}

fn mask_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "(unset)".to_string();
    }
    let visible: String = trimmed.chars().take(4).collect();
    if trimmed.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{visible}…")
    }
}
