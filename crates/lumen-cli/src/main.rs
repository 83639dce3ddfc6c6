/// Lumen command-line host

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use lumen_compiler::{list_files, Buffer, DiskFs, Driver, Extensions, ModuleResolver, RunController, RunOptions, RunResult};
use lumen_eval::{FragmentKind, RuntimeOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lumen")]
#[command(about = "Lumen - run, annotate and browse Lumen buffers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile and run a buffer
    Run(RunArgs),

    /// Print the widget regions of a buffer
    Annotate {
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Print regions as JSON
        #[arg(long)]
        json: bool,
    },

    /// List loadable files in a folder
    Ls {
        #[arg(value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Directory required namespaces are resolved against [default: FILE's directory]
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Namespace used when the buffer has no ns form
    #[arg(long, value_name = "NS", default_value = lumen_compiler::DEFAULT_NAMESPACE)]
    ns: String,

    /// Halt the run after this many milliseconds
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Checkpoints between yields to the scheduler
    #[arg(long, default_value_t = 1000)]
    yield_interval: u64,

    /// Maximum nested function calls
    #[arg(long, default_value_t = 10_000)]
    max_stack_depth: usize,

    /// Print the result and output as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => {
            let result = run(args).await?;
            if !result.is_success() {
                process::exit(1);
            }
        }
        Command::Annotate { input, json } => {
            let buffer = Buffer::from_text(read_source(&input)?);
            if json {
                println!("{}", serde_json::to_string_pretty(buffer.regions())?);
            } else {
                for region in buffer.regions() {
                    println!(
                        "{}:{}-{}:{}",
                        region.start.line, region.start.column, region.end.line, region.end.column
                    );
                }
            }
        }
        Command::Ls { dir } => {
            let fs = DiskFs::new(dir);
            for name in list_files(&fs, "", &Extensions::default())? {
                println!("{}", name);
            }
        }
    }
    Ok(())
}

fn read_source(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

async fn run(args: RunArgs) -> anyhow::Result<RunResult> {
    let source = read_source(&args.input)?;
    let options = RunOptions::new().namespace(args.ns).runtime(
        RuntimeOptions::new()
            .yield_interval(args.yield_interval)
            .max_stack_depth(args.max_stack_depth),
    );
    let root = match args.root {
        Some(root) => root,
        None => args.input.parent().map(PathBuf::from).unwrap_or_default(),
    };
    let mut driver = Driver::new(ModuleResolver::new(DiskFs::new(root))).with_options(options);
    let controller = driver.controller();

    let on_interrupt = controller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted");
            on_interrupt.halt();
        }
    });
    if let Some(ms) = args.timeout_ms {
        let on_timeout = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            tracing::info!("timed out after {}ms", ms);
            on_timeout.halt();
        });
    }

    if args.json {
        let result = driver.run(&source).await;
        let output = controller.output().map(|output| output.lines()).unwrap_or_default();
        let report = serde_json::json!({ "result": result, "output": output });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(result);
    }

    let done = Cell::new(false);
    let printed = Cell::new(0);
    let printer = async {
        while !done.get() {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flush(&controller, &printed);
        }
    };
    let run = async {
        let result = driver.run(&source).await;
        done.set(true);
        result
    };
    let (result, ()) = tokio::join!(run, printer);
    flush(&controller, &printed);

    if let RunResult::Success { value } = &result {
        tracing::debug!("result: {}", value);
    }
    Ok(result)
}

/// Print fragments appended since the last flush.
fn flush(controller: &RunController, printed: &Cell<usize>) {
    let Some(output) = controller.output() else {
        return;
    };
    let fragments = output.fragments_since(printed.get());
    printed.set(printed.get() + fragments.len());
    for fragment in fragments {
        match fragment.kind {
            FragmentKind::Output => println!("{}", fragment.text),
            FragmentKind::Error => eprintln!("{}", fragment.text),
        }
    }
}
