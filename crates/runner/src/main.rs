use std::num::NonZeroU32;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use runner::{
    Collector, CommandLine, LanguageRegistry, Outcome, Runner, RunnerConfig, RunnerOptions, Submission, Tee,
    TracingObserver,
};
use sandbox::{BoxPool, Constraints};
use tokio::io::AsyncReadExt;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "isorun", version, about = "Run code submissions inside isolate boxes")]
struct Cli {
    /// Language registry, overriding ISORUN_LANGUAGES
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile and run one source file
    Run(RunArgs),
    /// List the configured languages
    Languages,
    /// Run every language's hello world program
    Check {
        /// Only check this language
        #[arg(long)]
        lang: Option<String>,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Source file to run
    #[arg(long)]
    code: PathBuf,
    /// Language id; detected from the file extension when omitted
    #[arg(long)]
    lang: Option<String>,
    /// File fed to the program's stdin
    #[arg(long)]
    stdin: Option<PathBuf>,
    /// CPU time limit in seconds
    #[arg(long)]
    time: Option<f64>,
    /// Wall clock limit in seconds
    #[arg(long)]
    wall_time: Option<f64>,
    /// Memory limit in megabytes
    #[arg(long)]
    mem: Option<u64>,
    /// Maximum number of processes
    #[arg(long)]
    processes: Option<NonZeroU32>,
    /// Print the submission report as JSON on stdout
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn constraints(&self) -> anyhow::Result<Constraints> {
        let mut constraints = Constraints::default();
        if let Some(time) = self.time {
            constraints = constraints.with_cpu_time(seconds("--time", time)?);
        }
        if let Some(wall_time) = self.wall_time {
            constraints = constraints.with_wall_time(seconds("--wall-time", wall_time)?);
        }
        if let Some(mem) = self.mem {
            let kb = mem.checked_mul(1024).context("--mem is too large")?;
            constraints = constraints.with_memory_limit_kb(kb);
        }
        if let Some(processes) = self.processes {
            constraints = constraints.with_max_processes(processes);
        }
        Ok(constraints)
    }
}

fn seconds(flag: &str, value: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid {flag} value {value}"))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = RunnerConfig::from_env()?;
    if let Some(path) = cli.registry {
        config.languages_path = path;
    }
    let registry = LanguageRegistry::from_path(&config.languages_path)
        .with_context(|| format!("failed to load {}", config.languages_path.display()))?;

    match cli.command {
        Command::Languages => {
            for language in registry.languages() {
                let compiled = if language.needs_compilation() {
                    "compiled"
                } else {
                    "interpreted"
                };
                println!(
                    "{:<12} {:<6} {:<12} {}",
                    language.id, language.extension, compiled, language.full_name
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => run(&config, &registry, args).await,
        Command::Check { lang } => check(&config, &registry, lang.as_deref()).await,
    }
}

async fn run(
    config: &RunnerConfig,
    registry: &LanguageRegistry,
    args: RunArgs,
) -> anyhow::Result<ExitCode> {
    let mut language = registry.resolve(args.lang.as_deref(), &args.code)?.clone();
    if args.processes.is_some() {
        language.max_processes = args.processes;
    }
    let code = tokio::fs::read_to_string(&args.code)
        .await
        .with_context(|| format!("failed to read {}", args.code.display()))?;
    let stdin = match &args.stdin {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => Vec::new(),
    };
    let options = RunnerOptions {
        execute_constraints: args.constraints()?,
        ..RunnerOptions::default()
    };

    let pool = BoxPool::new(config.isolate.clone()).await?;
    let collector = Arc::new(Collector::new());
    let runner = Runner::new(pool, Arc::new(Tee(TracingObserver, collector.clone())))
        .with_options(options);
    let result = runner
        .run(&Submission {
            code,
            language,
            stdin,
        })
        .await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&collector.report())?);
    }
    Ok(match result {
        Ok(Outcome::Finished { .. }) => ExitCode::SUCCESS,
        Ok(Outcome::CompileFailed { .. }) => ExitCode::from(1),
        Err(_) => ExitCode::from(2),
    })
}

async fn check(
    config: &RunnerConfig,
    registry: &LanguageRegistry,
    only: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let languages = match only {
        Some(id) => vec![registry.get(id)?],
        None => registry.languages().iter().collect(),
    };
    let pool = BoxPool::new(config.isolate.clone()).await?;
    println!("isolate {}", pool.version().await?);

    let mut failures = 0;
    for language in languages {
        let Some(code) = &language.hello_world_code else {
            println!("{:<12} skipped (no hello world program)", language.id);
            continue;
        };
        if let Some(command) = &language.env_version_cmd {
            match toolchain_version(&pool, command).await {
                Ok(version) => println!("{:<12} version {version}", language.id),
                Err(err) => warn!(language = %language.id, error = %err, "failed to query version"),
            }
        }
        let collector = Arc::new(Collector::new());
        let runner = Runner::new(pool.clone(), collector.clone());
        let result = runner
            .run(&Submission {
                code: code.clone(),
                language: language.clone(),
                stdin: Vec::new(),
            })
            .await;
        let output = collector
            .report()
            .execution
            .and_then(|execution| execution.stdout.into_iter().next())
            .unwrap_or_default();
        match result {
            Ok(Outcome::Finished { execution, .. }) if execution.is_success() => {
                println!("{:<12} ok     {output}", language.id);
            }
            Ok(Outcome::Finished { execution, .. }) => {
                failures += 1;
                println!(
                    "{:<12} FAILED exit code {} ({:?})",
                    language.id, execution.exit_code, execution.status
                );
            }
            Ok(Outcome::CompileFailed { compilation }) => {
                failures += 1;
                println!(
                    "{:<12} FAILED compilation exit code {}",
                    language.id, compilation.exit_code
                );
            }
            Err(err) => {
                failures += 1;
                println!("{:<12} FAILED {err}", language.id);
            }
        }
    }
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// First non-empty output line of `command` run in a fresh box.
async fn toolchain_version(pool: &BoxPool, command: &CommandLine) -> anyhow::Result<String> {
    let sandbox = pool.allocate().await?;
    let result = async {
        // Toolchain launchers (a JVM, a compiler driver) start helper processes.
        let constraints = Constraints::compilation();
        let mut process = sandbox.run(command.args(), tokio::io::empty(), Some(&constraints))?;
        let mut stdout = process.stdout().context("stdout already taken")?;
        let mut stderr = process.stderr().context("stderr already taken")?;
        let (mut out, mut err) = (String::new(), String::new());
        let (read_out, read_err) = tokio::join!(
            stdout.read_to_string(&mut out),
            stderr.read_to_string(&mut err)
        );
        read_out?;
        read_err?;
        process.wait().await?;
        // Some compilers print their version on stderr.
        out.lines()
            .chain(err.lines())
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_owned)
            .context("version command printed nothing")
    }
    .await;
    let closed = sandbox.close().await;
    let version = result?;
    closed?;
    Ok(version)
}
