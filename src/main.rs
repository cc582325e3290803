use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use console::style;
use tessen::{BuildEngine, CONFIG_FILE, CancelToken, Config, Environment, FrontendPipeline, TessenError};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Clean the output directory and build everything once.
    Build {
        #[command(flatten)]
        options: Options,
    },
    /// Build, then serve the output and rebuild on every change.
    Dev {
        #[command(flatten)]
        options: Options,
        /// Port of the HTTP server.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the task graph as a Mermaid flowchart.
    Graph {
        #[command(flatten)]
        options: Options,
    },
}

#[derive(Args, Debug, Clone)]
struct Options {
    /// Configuration file, skipped when missing.
    #[arg(long, default_value = CONFIG_FILE)]
    config: Utf8PathBuf,
    /// Root of all inputs.
    #[arg(long)]
    source: Option<Utf8PathBuf>,
    /// Root of all outputs.
    #[arg(long)]
    output: Option<Utf8PathBuf>,
    /// Document to build and serve, `*` for every top-level document.
    #[arg(long)]
    html: Option<String>,
    /// Keep building independent branches after a task failed.
    #[arg(long)]
    keep_going: bool,
}

impl Options {
    fn load(&self) -> Result<Config, TessenError> {
        let mut config = Config::load(&self.config)?;

        if let Some(source) = &self.source {
            config.source_dir = source.clone();
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(html) = &self.html {
            config.target_html = html.clone();
        }
        config.keep_going |= self.keep_going;

        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tessen::init_logging();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match &e {
                TessenError::BuildFailed(failed) => {
                    eprint!("{}", failed.render_summary());
                    eprintln!("{}", style("Build failed.").red().bold());
                }
                e => eprintln!("{} {e}", style("Error:").red().bold()),
            }

            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(command: Command) -> Result<(), TessenError> {
    match command {
        Command::Build { options } => {
            let config = options.load()?;
            let pipeline = FrontendPipeline::from_config(&config);
            let mut engine = BuildEngine::new(Environment::build(config), pipeline);
            on_interrupt(engine.cancel_token());

            let report = engine.run_full()?;
            eprint!("{}", report.render_summary());
            eprintln!(
                "{} in {:?}",
                style("Build finished").green().bold(),
                report.duration
            );
            Ok(())
        }
        Command::Dev { options, port } => dev(options, port),
        Command::Graph { options } => {
            let config = options.load()?;
            let pipeline = FrontendPipeline::from_config(&config);
            let engine = BuildEngine::new(Environment::build(config), pipeline);
            println!("{}", engine.graph()?);
            Ok(())
        }
    }
}

#[cfg(feature = "live")]
fn dev(options: Options, port: Option<u16>) -> Result<(), TessenError> {
    let mut config = options.load()?;
    if let Some(port) = port {
        config.port = port;
    }

    let (listener, reload_port) = tessen::dev::reserve_port()?;
    let pipeline = FrontendPipeline::from_config(&config);
    let engine = BuildEngine::new(Environment::watch(config, reload_port), pipeline);
    on_interrupt(engine.cancel_token());

    tessen::dev::serve(engine, listener)
}

#[cfg(not(feature = "live"))]
fn dev(_: Options, _: Option<u16>) -> Result<(), TessenError> {
    Err(TessenError::Io(std::io::Error::other(
        "tessen was built without the `live` feature",
    )))
}

/// Cancels the build on the first Ctrl-C and exits on the second.
fn on_interrupt(cancel: CancelToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!("Ctrl-C handling unavailable: {e}");
                return;
            }
        };

        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, finishing running tasks...");
                cancel.cancel();
            }

            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    });
}
