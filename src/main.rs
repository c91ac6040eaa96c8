use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use conductor::app::AppConfig;
use conductor::models::{Message, ProviderId};
use conductor::orchestrator::{CompletionRequest, CompletionResponse, Orchestrator, RequestContext};
use conductor::platform::{AppPaths, ChainedCredentials, CredentialSource, KeyringCredentials};

mod cli;

use cli::{Cli, Commands, ConfigAction, RequestArgs};

fn init_logging(paths: &AppPaths, debug: bool) -> Result<WorkerGuard> {
    let level = if debug { "conductor=debug" } else { "conductor=info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let file_appender = tracing_appender::rolling::daily(paths.logs_dir(), "conductor.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = AppPaths::new()?;
    paths.ensure_dirs_exist()?;
    let _log_guard = init_logging(&paths, cli.debug)?;

    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
    info!("Starting conductor {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Config { action } => run_config(action, &config_path).await,
        Commands::ApiKey { provider, set, remove } => run_api_key(&provider, set, remove),
        Commands::Complete { request, ensemble, json } => {
            let orchestrator = load_orchestrator(&config_path).await?;
            run_complete(&orchestrator, &request, ensemble, json).await
        }
        Commands::Stream { request } => {
            let orchestrator = load_orchestrator(&config_path).await?;
            run_stream(&orchestrator, &request).await
        }
        Commands::Models => {
            let orchestrator = load_orchestrator(&config_path).await?;
            print_models(&orchestrator);
            Ok(())
        }
        Commands::Status => {
            let orchestrator = load_orchestrator(&config_path).await?;
            print_status(&orchestrator);
            Ok(())
        }
    }
}

async fn load_orchestrator(config_path: &Path) -> Result<Orchestrator> {
    let config = AppConfig::load(config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    let sources: Vec<Box<dyn CredentialSource>> = vec![
        Box::new(config.env_credentials()),
        Box::new(KeyringCredentials::new()),
    ];
    let credentials = ChainedCredentials::new(sources);
    Ok(Orchestrator::from_config(&config, &credentials).await?)
}

async fn run_complete(orchestrator: &Orchestrator, args: &RequestArgs, ensemble: bool, json: bool) -> Result<()> {
    let mut request = build_request(args).await?;
    if ensemble {
        request = request.with_ensemble();
    }

    let token = cancel_on_interrupt();
    let response = orchestrator.complete_with_cancel(request, token).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{}", response.content);
        print_summary(&response);
    }
    Ok(())
}

async fn run_stream(orchestrator: &Orchestrator, args: &RequestArgs) -> Result<()> {
    let request = build_request(args).await?.with_streaming();
    let token = cancel_on_interrupt();
    let mut fragments = Box::pin(orchestrator.stream_with_cancel(request, token).await.into_stream());

    let mut stdout = std::io::stdout();
    while let Some(fragment) = fragments.next().await {
        write!(stdout, "{}", fragment?)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}

/// Token that fires on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let on_interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });
    token
}

fn print_models(orchestrator: &Orchestrator) {
    let models = orchestrator.list_available_models();
    if models.is_empty() {
        println!("No providers are enabled. Set an API key with `conductor api-key <provider> --set <key>`.");
    }
    for model in models {
        println!("{:<20} {}", model.to_string(), model.provider().display_name());
    }
}

fn print_status(orchestrator: &Orchestrator) {
    for status in orchestrator.provider_status() {
        let state = if status.enabled { "enabled" } else { "disabled" };
        println!("{:<10} {:<9} {} models", status.name, state, status.models.len());
    }
    println!();
    for window in orchestrator.rate_limit_status() {
        match window.resets_in {
            Some(resets_in) => println!(
                "{:<10} {}/{} requests, resets in {}s",
                window.provider, window.count, window.budget, resets_in.as_secs()
            ),
            None => println!("{:<10} 0/{} requests", window.provider, window.budget),
        }
    }
}

async fn build_request(args: &RequestArgs) -> Result<CompletionRequest> {
    let mut messages = Vec::new();
    if let Some(system) = &args.system {
        messages.push(Message::system(system.clone()));
    }
    messages.push(Message::user(args.prompt.clone()));

    let mut request = CompletionRequest::new(messages);
    if let Some(model) = &args.model {
        request = request.with_model_name(model)?;
    }
    if let Some(temperature) = args.temperature {
        request = request.with_temperature(temperature);
    }
    if let Some(max_tokens) = args.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }

    if !args.files.is_empty() {
        let mut context = RequestContext::default();
        for path in &args.files {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            context = context.with_file(path.display().to_string(), content);
        }
        request = request.with_context(context);
    }

    Ok(request)
}

fn print_summary(response: &CompletionResponse) {
    let cached = if response.cached { ", cached" } else { "" };
    eprintln!(
        "\n[{} via {}, {} ms, {} in / {} out tokens{}]",
        response.model,
        response.provider.display_name(),
        response.duration_ms,
        response.usage.input_tokens,
        response.usage.output_tokens,
        cached
    );

    if let Some(ensemble) = &response.ensemble {
        for candidate in &ensemble.candidates {
            eprintln!("  {:<18} {:>3}  {}", candidate.model.to_string(), candidate.score, candidate.rationale);
        }
    }
}

async fn run_config(action: ConfigAction, config_path: &Path) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if config_path.exists() && !force {
                bail!("{} already exists; pass --force to overwrite", config_path.display());
            }
            AppConfig::default().save(config_path).await?;
            println!("Wrote default configuration to {}", config_path.display());
        }
        ConfigAction::Show => {
            let config = AppConfig::load(config_path)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

fn run_api_key(provider: &str, set: Option<String>, remove: bool) -> Result<()> {
    let provider: ProviderId = provider
        .parse()
        .with_context(|| format!("Unknown provider '{}'; expected openai, anthropic or gemini", provider))?;
    let keyring = KeyringCredentials::new();

    if let Some(key) = set {
        keyring.store(provider, key.trim())?;
        println!("Stored API key for {}", provider.display_name());
    } else if remove {
        keyring.delete(provider)?;
        println!("Removed API key for {}", provider.display_name());
    } else {
        let variable = provider.default_api_key_env();
        let in_env = std::env::var(variable).is_ok_and(|v| !v.trim().is_empty());
        println!(
            "{}: ${} {}",
            provider.display_name(),
            variable,
            if in_env { "is set" } else { "is not set" }
        );
    }

    Ok(())
}
