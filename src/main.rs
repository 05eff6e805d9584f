// Module-specific lints configuration
#![allow(clippy::uninlined_format_args)]

use anyhow::{Result, anyhow, Context};
use log::{error, warn, info, LevelFilter, Log, Metadata, Record, Level, SetLoggerError};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use clap::{Parser, ValueEnum, CommandFactory, Subcommand, Args};
use clap_complete::{generate, Shell};

use contextbridge::app_config::{self, Config};
use contextbridge::dataset::pairs::PairMode;
use contextbridge::errors::AppError;
use contextbridge::file_utils::{FileManager, FileType};
use contextbridge::inference::modes;
use contextbridge::inference::{ContextualTranslator, TranslateOptions};
use contextbridge::{Controller, IdiomService};

/// CLI Wrapper for LogLevel to implement ValueEnum
#[derive(Debug, Clone, ValueEnum)]
enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for app_config::LogLevel {
    fn from(cli_level: CliLogLevel) -> Self {
        match cli_level {
            CliLogLevel::Error => app_config::LogLevel::Error,
            CliLogLevel::Warn => app_config::LogLevel::Warn,
            CliLogLevel::Info => app_config::LogLevel::Info,
            CliLogLevel::Debug => app_config::LogLevel::Debug,
            CliLogLevel::Trace => app_config::LogLevel::Trace,
        }
    }
}

/// CLI Wrapper for PairMode to implement ValueEnum
#[derive(Debug, Clone, ValueEnum)]
enum CliPairMode {
    IdiomToIdiom,
    IdiomToMeaning,
}

impl From<CliPairMode> for PairMode {
    fn from(cli_mode: CliPairMode) -> Self {
        match cli_mode {
            CliPairMode::IdiomToIdiom => PairMode::IdiomToIdiom,
            CliPairMode::IdiomToMeaning => PairMode::IdiomToMeaning,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the training corpus from the idiom tables
    Prepare(PrepareArgs),

    /// Fine-tune adapters on the prepared corpus
    Train(TrainArgs),

    /// Score a checkpoint on the test split
    Evaluate(EvaluateArgs),

    /// Translate idioms with a trained checkpoint
    Translate(TranslateArgs),

    /// Generate shell completions for contextbridge
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
struct PrepareArgs {
    /// Directory holding the per-language tables
    #[arg(short, long)]
    dataset_dir: Option<PathBuf>,

    /// Directory receiving the prepared corpus
    #[arg(short = 'o', long)]
    corpus_dir: Option<PathBuf>,

    /// Translate idioms into idioms or into their meanings
    #[arg(short, long, value_enum)]
    pair_mode: Option<CliPairMode>,

    /// Skip sentence-template augmentation
    #[arg(long)]
    no_augment: bool,
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Directory that receives checkpoints
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Number of passes over the training split
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Hard cap on optimizer steps
    #[arg(long)]
    max_steps: Option<usize>,

    /// Peak learning rate
    #[arg(long)]
    learning_rate: Option<f32>,

    /// Micro-batch size
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Resume from a checkpoint directory
    #[arg(short, long)]
    resume_from: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    /// Checkpoint directory (defaults to the training output directory)
    #[arg(short, long)]
    checkpoint: Option<PathBuf>,

    /// Beam width used for generation
    #[arg(short, long)]
    beam_width: Option<usize>,
}

#[derive(Args, Debug)]
struct TranslateArgs {
    /// Checkpoint directory (defaults to the training output directory)
    #[arg(short, long)]
    checkpoint: Option<PathBuf>,

    /// Source language code (e.g., 'en', 'hi', 'te')
    #[arg(short, long)]
    source_language: Option<String>,

    /// Target language code (e.g., 'en', 'hi', 'te')
    #[arg(short, long)]
    target_language: Option<String>,

    /// Translate a single text
    #[arg(long, conflicts_with_all = ["demo", "input_file"])]
    text: Option<String>,

    /// Run the fixed demonstration set
    #[arg(long, conflicts_with = "input_file")]
    demo: bool,

    /// Newline-delimited texts to translate
    #[arg(short, long)]
    input_file: Option<PathBuf>,

    /// Output file for --input-file (defaults to <input>.<target>.<ext>)
    #[arg(short, long, requires = "input_file")]
    output_file: Option<PathBuf>,

    /// Beam width
    #[arg(short, long)]
    beam_width: Option<usize>,

    /// Number of candidates to return
    #[arg(short, long)]
    num_candidates: Option<usize>,

    /// Print the --text response as JSON
    #[arg(long, requires = "text")]
    json: bool,

    /// Detect table idioms inside the --text sentence and translate around them
    #[arg(long, requires = "text")]
    contextual: bool,
}

/// ContextBridge - idiom-to-idiom translation for English, Hindi and Telugu
///
/// Fine-tunes low-rank adapters on a multilingual translation model so that
/// idioms keep their figurative meaning across languages.
#[derive(Parser, Debug)]
#[command(name = "contextbridge")]
#[command(author = "ContextBridge Team")]
#[command(version)]
#[command(about = "Idiom-aware translation across English, Hindi and Telugu")]
#[command(long_about = "ContextBridge prepares an idiom corpus, fine-tunes adapters and serves idiom translations.

EXAMPLES:
    contextbridge prepare                                   # Build the corpus from ./Dataset
    contextbridge train --epochs 3                          # Fine-tune adapters
    contextbridge evaluate                                  # Score the best checkpoint
    contextbridge translate -s en -t te --text \"piece of cake\"
    contextbridge translate --demo                          # Run the demonstration set
    contextbridge translate -s hi -t en -i idioms.txt       # Translate a file line by line
    contextbridge translate                                 # Interactive mode
    contextbridge completions bash > contextbridge.bash     # Generate bash completions

CONFIGURATION:
    Configuration is stored in conf.json by default. You can specify a different
    config file with --config-path. If the config file doesn't exist, a default one
    will be created automatically. Command line flags override the file.

LANGUAGES:
    en / eng / eng_Latn / English
    hi / hin / hin_Deva / Hindi
    te / tel / tel_Telu / Telugu")]
struct CommandLineOptions {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short = 'C', long, default_value = "conf.json", global = true)]
    config_path: String,

    /// Set logging level
    #[arg(short, long, value_enum, global = true)]
    log_level: Option<CliLogLevel>,
}

// @struct: Custom logger implementation
struct CustomLogger {
    level: LevelFilter,
}

impl CustomLogger {
    // @creates: New logger with specified level
    fn new(level: LevelFilter) -> Self {
        CustomLogger { level }
    }

    // @initializes: Global logger
    fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        let logger = Box::new(CustomLogger::new(level));
        log::set_boxed_logger(logger)?;
        log::set_max_level(level);
        Ok(())
    }

    // @returns: Emoji for log level
    fn get_emoji_for_level(level: Level) -> &'static str {
        match level {
            Level::Error => "❌ ",
            Level::Warn => "🚧 ",
            Level::Info => " ",
            Level::Debug => "🔍 ",
            Level::Trace => "📋 ",
        }
    }

    // @returns: ANSI colour for log level
    fn get_color_for_level(level: Level) -> &'static str {
        match level {
            Level::Error => "1;31",
            Level::Warn => "1;33",
            Level::Info => "1;32",
            Level::Debug => "1;36",
            Level::Trace => "1;35",
        }
    }
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now = chrono::Local::now().format("%H:%M:%S.%3f");
            let mut stderr = std::io::stderr();
            let _ = writeln!(
                stderr,
                "\x1B[{}m{} {} {}\x1B[0m",
                Self::get_color_for_level(record.level()),
                now,
                Self::get_emoji_for_level(record.level()),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn level_filter(level: &app_config::LogLevel) -> LevelFilter {
    match level {
        app_config::LogLevel::Error => LevelFilter::Error,
        app_config::LogLevel::Warn => LevelFilter::Warn,
        app_config::LogLevel::Info => LevelFilter::Info,
        app_config::LogLevel::Debug => LevelFilter::Debug,
        app_config::LogLevel::Trace => LevelFilter::Trace,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Install the logger at trace so the configured level can be applied later
    if let Err(e) = CustomLogger::init(LevelFilter::Trace) {
        eprintln!("Failed to install logger: {}", e);
        return ExitCode::FAILURE;
    }
    log::set_max_level(LevelFilter::Info);

    let cli = CommandLineOptions::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

/// Dispatch a parsed command line
async fn run(cli: CommandLineOptions) -> Result<(), AppError> {
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = CommandLineOptions::command();
        generate(*shell, &mut cmd, "contextbridge", &mut std::io::stdout());
        return Ok(());
    }

    // If log level is set via command line, apply it immediately
    if let Some(cmd_log_level) = &cli.log_level {
        log::set_max_level(level_filter(&cmd_log_level.clone().into()));
    }

    let mut config = Config::load_or_create(&cli.config_path)?;
    if let Some(log_level) = &cli.log_level {
        config.log_level = log_level.clone().into();
    } else {
        log::set_max_level(level_filter(&config.log_level));
    }

    match cli.command {
        Commands::Prepare(args) => run_prepare(config, args)?,
        Commands::Train(args) => run_train(config, args)?,
        Commands::Evaluate(args) => run_evaluate(config, args)?,
        Commands::Translate(args) => run_translate(config, args).await?,
        Commands::Completions { .. } => {}
    }
    Ok(())
}

fn run_prepare(mut config: Config, args: PrepareArgs) -> Result<()> {
    // Override config with CLI options if provided
    if let Some(dataset_dir) = args.dataset_dir {
        config.data.dataset_dir = dataset_dir;
    }
    if let Some(corpus_dir) = args.corpus_dir {
        config.data.corpus_dir = corpus_dir;
    }
    if let Some(pair_mode) = args.pair_mode {
        config.data.pair_mode = pair_mode.into();
    }
    if args.no_augment {
        config.data.add_context_variations = false;
    }

    if !FileManager::dir_exists(&config.data.dataset_dir) {
        return Err(anyhow!("Dataset directory does not exist: {:?}", config.data.dataset_dir));
    }
    let tables = FileManager::find_files(&config.data.dataset_dir, "csv")?;
    info!("Found {} table(s) in {:?}", tables.len(), config.data.dataset_dir);

    let controller = Controller::with_config(config)?;
    let corpus = controller.prepare()?;
    for (direction, count) in &corpus.stats.directions {
        info!("  {}: {} pairs", direction, count);
    }
    Ok(())
}

fn run_train(mut config: Config, args: TrainArgs) -> Result<()> {
    if let Some(output_dir) = args.output_dir {
        config.training.output_dir = output_dir;
    }
    if let Some(epochs) = args.epochs {
        config.training.num_train_epochs = epochs;
    }
    if args.max_steps.is_some() {
        config.training.max_steps = args.max_steps;
    }
    if let Some(learning_rate) = args.learning_rate {
        config.training.learning_rate = learning_rate;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.per_device_train_batch_size = batch_size;
    }

    if let Some(resume_from) = &args.resume_from {
        if FileManager::detect_file_type(resume_from)? != FileType::Checkpoint {
            return Err(anyhow!("Not a checkpoint directory: {:?}", resume_from));
        }
    }

    let controller = Controller::with_config(config)?;
    let outcome = controller.train(args.resume_from.as_deref())?;
    info!("Best checkpoint saved to {}", outcome.output_dir.display());
    Ok(())
}

fn run_evaluate(config: Config, args: EvaluateArgs) -> Result<()> {
    let controller = Controller::with_config(config)?;
    let report = controller.evaluate(args.checkpoint.as_deref(), args.beam_width)?;

    println!("{:<22} {:>10}", "metric", "overall");
    for (name, value) in &report.overall {
        println!("{:<22} {:>10.2}", name, value);
    }
    for (direction, metrics) in &report.per_direction {
        println!("\n{}", direction);
        for (name, value) in metrics {
            println!("  {:<20} {:>10.2}", name, value);
        }
    }
    Ok(())
}

async fn run_translate(mut config: Config, args: TranslateArgs) -> Result<()> {
    if let Some(checkpoint) = &args.checkpoint {
        config.inference.checkpoint_dir = Some(checkpoint.clone());
    }
    if let Some(beam_width) = args.beam_width {
        config.inference.beam_width = beam_width;
    }
    if let Some(num_candidates) = args.num_candidates {
        config.inference.num_candidates = num_candidates;
    }
    config.validate().context("Configuration validation failed")?;
    let options = TranslateOptions::from_config(&config.inference);

    if let (Some(text), true) = (&args.text, args.contextual) {
        let (source, target) = languages(&args)?;
        let controller = Controller::with_config(config)?;
        let engine = controller.load_engine(None)?;
        let detector = controller.idiom_detector()?;
        let translator = ContextualTranslator::new(&engine, &detector, options);
        let translation = translator.translate(text, &source, &target)?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&translation)?);
        } else {
            println!("{}", translation.text);
            for idiom in &translation.idioms {
                info!("  '{}' -> '{}'", idiom.original, idiom.translation);
            }
        }
        return Ok(());
    }

    // Single text goes through the service boundary
    if let Some(text) = &args.text {
        let (source, target) = languages(&args)?;
        let service = IdiomService::from_config(&config);
        let response = service.translate(text, &source, &target);
        if args.json {
            println!("{}", serde_json::to_string_pretty(&response)?);
        } else {
            for candidate in &response.candidates {
                println!("{}", candidate);
            }
            if let Some(e) = &response.error {
                error!("{}", e);
            }
        }
        return Ok(());
    }

    let controller = Controller::with_config(config)?;
    let engine = controller.load_engine(None)?;
    let stdout = std::io::stdout();
    let mut output = stdout.lock();

    if args.demo {
        let summary = modes::run_demo(&engine, &options, &mut output)?;
        info!("Demo finished: {}/{} translated", summary.translated, summary.total);
        return Ok(());
    }

    if let Some(input_file) = &args.input_file {
        let (source, target) = languages(&args)?;
        if FileManager::detect_file_type(input_file)? == FileType::Table {
            warn!("{:?} looks like a table; every line is translated as a text", input_file);
        }
        let output_file = args
            .output_file
            .clone()
            .unwrap_or_else(|| FileManager::generate_output_path(input_file, &target));
        modes::translate_file(&engine, input_file, &output_file, &source, &target, &options)?;
        info!("Success: {:?}", output_file);
        return Ok(());
    }

    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    modes::run_interactive(&engine, &options, &mut input, &mut output)?;
    Ok(())
}

fn languages(args: &TranslateArgs) -> Result<(String, String)> {
    match (&args.source_language, &args.target_language) {
        (Some(source), Some(target)) => Ok((source.clone(), target.clone())),
        _ => Err(anyhow!("--source-language and --target-language are required")),
    }
}
