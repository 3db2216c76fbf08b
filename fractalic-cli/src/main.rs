//! Fractalic CLI - headless execution of agentic Markdown documents

use clap::{Arg, ArgAction, Command};
use fractalic_core::{Config, Engine, FractalicError, Result};
use std::path::PathBuf;
use tracing::{error, info, Level};

/// CLI arguments structure
#[derive(Debug, Clone)]
pub struct Args {
    pub file: PathBuf,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub config_file: Option<PathBuf>,
    pub tools_dir: Option<PathBuf>,
    pub parameter_text: Option<String>,
    pub verbose: bool,
    pub json: bool,
    pub list_tools: bool,
}

impl Args {
    /// Parse command line arguments
    pub fn parse() -> Self {
        let matches = Command::new("fractalic")
            .version("0.1.0")
            .about("Execute structured Markdown documents as agentic workflows")
            .long_about(
                "Fractalic executes a Markdown document as a program: prose under \
                headings is context, and YAML-bodied operation blocks (@import, @llm, \
                @shell, @run, @return, @goto) are statements that transform a live \
                in-memory tree of the document."
            )
            .arg(
                Arg::new("file")
                    .help("Markdown document to execute (.md)")
                    .required_unless_present("list-tools")
                    .index(1)
                    .value_parser(clap::value_parser!(PathBuf)),
            )
            .arg(
                Arg::new("provider")
                    .long("provider")
                    .help("Override the configured default LLM provider")
                    .value_parser(clap::value_parser!(String)),
            )
            .arg(
                Arg::new("model")
                    .long("model")
                    .help("Override the provider's configured model")
                    .value_parser(clap::value_parser!(String)),
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .help("Path to a settings file (YAML)")
                    .value_parser(clap::value_parser!(PathBuf)),
            )
            .arg(
                Arg::new("tools-dir")
                    .long("tools-dir")
                    .help("Directory scanned for local tools")
                    .value_parser(clap::value_parser!(PathBuf)),
            )
            .arg(
                Arg::new("param")
                    .short('p')
                    .long("param")
                    .help("Parameter text prepended as '# Input Parameters' before execution")
                    .value_parser(clap::value_parser!(String)),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .help("Enable debug logging")
                    .action(ArgAction::SetTrue),
            )
            .arg(
                Arg::new("json")
                    .long("json")
                    .help("Print the run outcome as JSON instead of the return content")
                    .action(ArgAction::SetTrue),
            )
            .arg(
                Arg::new("list-tools")
                    .long("list-tools")
                    .help("List discoverable tools and exit")
                    .action(ArgAction::SetTrue),
            )
            .after_help(
                "EXIT CODES:\n    \
                0  success\n    \
                1  parse or validation error\n    \
                2  runtime error\n    \
                3  cancelled\n\n\
                EXAMPLES:\n    \
                fractalic workflow.md\n    \
                fractalic --provider openai --model gpt-4o workflow.md\n    \
                fractalic -p 'topic: penguins' workflow.md\n    \
                fractalic --tools-dir ./tools --list-tools",
            )
            .get_matches();

        Self {
            file: matches
                .get_one::<PathBuf>("file")
                .cloned()
                .unwrap_or_default(),
            provider: matches.get_one::<String>("provider").cloned(),
            model: matches.get_one::<String>("model").cloned(),
            config_file: matches.get_one::<PathBuf>("config").cloned(),
            tools_dir: matches.get_one::<PathBuf>("tools-dir").cloned(),
            parameter_text: matches.get_one::<String>("param").cloned(),
            verbose: matches.get_flag("verbose"),
            json: matches.get_flag("json"),
            list_tools: matches.get_flag("list-tools"),
        }
    }

    /// Validate the arguments with actionable error messages
    pub fn validate(&self) -> Result<()> {
        if self.list_tools {
            return Ok(());
        }
        if !self.file.exists() {
            return Err(FractalicError::config(format!(
                "document not found: {}\n\n\
                Please check that the path is correct and the file is readable.\n\
                Example: fractalic workflow.md",
                self.file.display()
            )));
        }
        if self.file.is_dir() {
            return Err(FractalicError::config(format!(
                "path is a directory, not a document: {}",
                self.file.display()
            )));
        }
        if let Some(extension) = self.file.extension() {
            let ext = extension.to_string_lossy().to_lowercase();
            if ext != "md" && ext != "markdown" {
                return Err(FractalicError::config(format!(
                    "document must be a markdown file (.md or .markdown): {}",
                    self.file.display()
                )));
            }
        } else {
            return Err(FractalicError::config(format!(
                "document must have a markdown extension: {}",
                self.file.display()
            )));
        }
        if let Some(config_file) = &self.config_file {
            if !config_file.is_file() {
                return Err(FractalicError::config(format!(
                    "settings file not found: {}",
                    config_file.display()
                )));
            }
        }
        Ok(())
    }

    /// Load configuration and apply CLI overrides
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::discover(self.config_file.as_deref())?;

        if let Some(provider) = &self.provider {
            config.default_provider = provider.clone();
            config.providers.entry(provider.clone()).or_default();
        }
        if let Some(model) = &self.model {
            let name = config.default_provider.clone();
            if name.is_empty() {
                return Err(FractalicError::config(
                    "--model requires a provider (set --provider or defaultProvider)",
                ));
            }
            config.providers.entry(name).or_default().model = model.clone();
        }
        if let Some(tools_dir) = &self.tools_dir {
            config.tools_dir = Some(tools_dir.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

/// List discoverable tools and exit
async fn list_tools(args: &Args) -> Result<()> {
    let config = args.load_config()?;
    let engine = Engine::new(config);
    engine.init().await?;

    let registry = engine.registry();
    let names = registry.names().await;
    if names.is_empty() {
        println!("No tools found.");
        if args.tools_dir.is_none() {
            println!("\nUse --tools-dir <directory> or set toolsDir in the settings file.");
        }
        return Ok(());
    }

    println!("Registered tools:\n");
    for name in names {
        if let Some(spec) = registry.get(&name).await {
            println!("  {}", spec.name);
            if !spec.description.is_empty() {
                println!("      {}", spec.description);
            }
            println!("      kind: {:?}", spec.kind);
        }
    }
    Ok(())
}

/// Print the chain of failed frames the way the runtime surfaces them
fn print_error_chain(err: &FractalicError) {
    eprintln!("error: {}: {}", err.kind(), err);
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        eprintln!("  caused by: {}", cause);
        source = cause.source();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(args.verbose)
        .with_ansi(true)
        .init();

    if args.list_tools {
        if let Err(e) = list_tools(&args).await {
            print_error_chain(&e);
            std::process::exit(e.exit_code());
        }
        return;
    }

    if let Err(e) = args.validate() {
        print_error_chain(&e);
        std::process::exit(1);
    }

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            print_error_chain(&e);
            std::process::exit(1);
        }
    };

    let engine = Engine::new(config);
    if let Err(e) = engine.init().await {
        print_error_chain(&e);
        std::process::exit(e.exit_code());
    }

    // Ctrl+C aborts the run at its next suspension point
    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("cancel requested, aborting run");
            cancel.cancel();
        }
    });

    info!("executing {}", args.file.display());
    match engine
        .run_document(&args.file, args.parameter_text.as_deref())
        .await
    {
        Ok(outcome) => {
            if args.json {
                match serde_json::to_string_pretty(&outcome) {
                    Ok(json) => println!("{}", json),
                    Err(e) => error!("failed to serialize outcome: {}", e),
                }
            } else if let Some(content) = &outcome.return_content {
                print!("{}", content);
            }
            info!(
                "run complete (snapshot {}, explicit return: {})",
                outcome.snapshot_label, outcome.explicit_return
            );
        }
        Err(e) => {
            error!("run failed");
            print_error_chain(&e);
            std::process::exit(e.exit_code());
        }
    }
}
