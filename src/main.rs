use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use mail_agent::config::{Config, DEFAULT_RULES_PATH, DEFAULT_SETTINGS_PATH};
use mail_agent::delivery::DryRunSink;
use mail_agent::error::{EXIT_CONFIG_ERROR, EXIT_SUCCESS};
use mail_agent::llm::ProviderRegistry;
use mail_agent::pipeline::MessageProcessor;
use mail_agent::pipeline::parser;
use mail_agent::pipeline::types::Outcome;
use mail_agent::{Error, logging};

/// LLM auto-responder for pipe delivery. Reads one message on stdin.
#[derive(Debug, Parser)]
#[command(name = "mail-agent", version, about)]
struct Args {
    /// Settings file.
    #[arg(long, env = "MAIL_AGENT_CONFIG", default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,

    /// Rules file.
    #[arg(long, env = "MAIL_AGENT_RULES", default_value = DEFAULT_RULES_PATH)]
    rules: PathBuf,

    /// Envelope sender as reported by the transport (e.g. `${sender}`).
    #[arg(long)]
    sender: Option<String>,

    /// Generate replies but do not deliver them.
    #[arg(long)]
    dry_run: bool,

    /// Check the configuration and exit.
    #[arg(long, conflicts_with = "test")]
    validate: bool,

    /// Process a message file (`-` for stdin) in dry-run mode and print
    /// what would happen.
    #[arg(long, value_name = "FILE|-")]
    test: Option<PathBuf>,
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// How long leftover blocking work may delay exit once the outcome is known.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> ExitCode {
    // Install rustls crypto provider before any TLS usage. Already-installed is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("mail-agent: cannot start runtime: {e}");
            return exit(Error::from(e).exit_code());
        }
    };

    let code = runtime.block_on(run(args));
    // The exit code is decided; do not wait on blocking I/O past the deadline.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    exit(code)
}

async fn run(args: Args) -> i32 {
    let config = match Config::load(&args.config, &args.rules) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mail-agent: {e}");
            if args.validate {
                return EXIT_CONFIG_ERROR;
            }
            return Error::from(e).exit_code();
        }
    };

    let _log_guard = match logging::init(&config.settings.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("mail-agent: {e:#}");
            None
        }
    };

    if args.validate {
        return validate(&config);
    }

    if let Some(path) = &args.test {
        return run_test(&config, path, args.sender.as_deref()).await;
    }

    run_pipe(&config, args.sender.as_deref(), args.dry_run).await
}

/// Print every configuration problem. Exit `EX_CONFIG` if there are any.
fn validate(config: &Config) -> i32 {
    let problems = config.validate();
    if !problems.is_empty() {
        eprintln!("Configuration errors:");
        for problem in &problems {
            eprintln!("  - {problem}");
        }
        return EXIT_CONFIG_ERROR;
    }

    let registry = ProviderRegistry::from_settings(&config.settings.llm);
    println!("Configuration OK");
    println!("  rules:     {}", config.rule_specs.len());
    println!("  providers: {}", registry.available().join(", "));
    EXIT_SUCCESS
}

/// Normal pipe delivery: stdin in, exit code out.
async fn run_pipe(config: &Config, sender: Option<&str>, dry_run: bool) -> i32 {
    let recorder = dry_run.then(|| Arc::new(DryRunSink::new()));
    let processor = match MessageProcessor::from_config(config, recorder) {
        Ok(processor) => processor,
        Err(e) => {
            error!(error = %e, "Pipeline setup failed");
            return e.exit_code();
        }
    };

    let mut raw = Vec::new();
    if let Err(e) = tokio::io::stdin().read_to_end(&mut raw).await {
        let e = Error::from(e);
        error!(error = %e, "Failed to read message");
        return e.exit_code();
    }
    info!(bytes = raw.len(), dry_run, "Message received");

    match processor.process_raw(&raw, sender).await {
        Ok(outcome) => {
            if let Outcome::NoAction(reason) = &outcome {
                info!(%reason, "No action taken");
            }
            outcome.disposition().exit_code()
        }
        Err(e) => {
            error!(error = %e, disposition = ?e.disposition(), "Message not handled");
            e.exit_code()
        }
    }
}

/// Dry-run a message file and print the decision to stdout.
async fn run_test(config: &Config, path: &Path, sender: Option<&str>) -> i32 {
    let raw = if path.as_os_str() == "-" {
        let mut raw = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut raw)
            .await
            .map(|_| raw)
    } else {
        tokio::fs::read(path).await
    };
    let raw = match raw {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("mail-agent: cannot read {}: {e}", path.display());
            return Error::from(e).exit_code();
        }
    };

    let recorder = Arc::new(DryRunSink::new());
    let processor = match MessageProcessor::from_config(config, Some(recorder)) {
        Ok(processor) => processor,
        Err(e) => {
            println!("Setup failed: {e}");
            return e.exit_code();
        }
    };

    let message = match parser::parse(&raw, sender) {
        Ok(message) => message,
        Err(e) => {
            let e = Error::from(e);
            println!("Decision: bounce ({e})");
            return e.exit_code();
        }
    };

    println!("From:       {}", message.from);
    println!("Subject:    {}", message.subject);
    println!("Message-ID: {}", message.message_id);
    let matches = processor.matcher().match_all(&message);
    if matches.is_empty() {
        println!("Rules:      (none match)");
    }
    for matched in &matches {
        println!(
            "Rule:       {} (priority {}, provider {}, mode {})",
            matched.rule.name, matched.rule.priority, matched.rule.provider, matched.rule.mode
        );
    }
    println!();

    let outcome = match processor.process(&message).await {
        Ok(outcome) => outcome,
        Err(e) => {
            println!("Decision: {:?} ({e})", e.disposition());
            return e.exit_code();
        }
    };

    match &outcome {
        Outcome::NoAction(reason) => {
            println!("Decision: no action ({reason})");
        }
        Outcome::Delivered {
            rule,
            provider,
            reply,
            result,
        } => {
            println!("Decision: reply via {} (rule {rule}, provider {provider})", result.mode);
            println!();
            println!("To: {}", reply.to_address);
            println!("Subject: {}", reply.subject);
            if let Some(in_reply_to) = &reply.in_reply_to {
                println!("In-Reply-To: {in_reply_to}");
            }
            if let Some(references) = &reply.references {
                println!("References: {references}");
            }
            println!();
            println!("{}", reply.body);
        }
    }
    outcome.disposition().exit_code()
}
