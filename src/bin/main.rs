//! CLI tool for WMI Bridge (wbridge)

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
use wbridgelib::{event_types, BridgeConfig, CallbackSink, Error, EventSink, Session};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "wbridge")]
#[command(about = "WMI Bridge: query WMI classes and watch instance events as JSON", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Stop expanding embedded objects below this depth
    #[arg(long, global = true)]
    max_depth: Option<usize>,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Print every instance of a class, e.g. `cimv2\Win32_Process`
    Query {
        /// Class name, optionally prefixed with a namespace below the root
        class: String,
    },
    /// Print instance events for a class until Ctrl-C
    Watch {
        /// Class name, optionally prefixed with a namespace below the root
        class: String,

        /// Intrinsic event class without the `__` prefix
        #[arg(short, long, default_value = event_types::INSTANCE_MODIFICATION)]
        event: String,
    },
    /// Print a sample configuration file
    Config,
}

#[cfg(feature = "cli")]
fn load_config(cli: &Cli) -> Result<BridgeConfig, Error> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::from_toml_file(&path.to_string_lossy())?,
        None => BridgeConfig::default(),
    };
    if cli.max_depth.is_some() {
        config.max_depth = cli.max_depth;
    }
    Ok(config)
}

/// Connect to the local service; bootstrap failures exit with status 1
#[cfg(feature = "cli")]
fn connect(config: BridgeConfig) -> Result<Session, Error> {
    let connector = Session::local_connector()?;
    Ok(Session::connect_or_exit(connector, config))
}

#[cfg(feature = "cli")]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = load_config(&cli)?;

    env_logger::Builder::new()
        .filter_level(config.log_level.to_filter())
        .parse_default_env()
        .init();

    match &cli.command {
        Commands::Config => {
            print!("{}", BridgeConfig::sample_toml());
        }

        Commands::Query { class } => {
            let session = connect(config)?;
            let indentation = session.config().indentation.clone();
            let trees = session.query_trees(class)?;
            for tree in &trees {
                println!("{}", tree.render(&indentation)?);
            }
            log::info!("{} instances of {}", trees.len(), class);
        }

        Commands::Watch { class, event } => {
            let session = connect(config)?;
            let marshaler = session.marshaler().clone();
            let sink: std::sync::Arc<dyn EventSink> =
                std::sync::Arc::new(CallbackSink::new(move |objects| {
                    let received = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
                    for object in objects {
                        match marshaler.to_text(object.as_ref()) {
                            Ok(text) => println!("[{}]\n{}", received, text),
                            Err(e) => log::warn!("Could not marshal event: {}", e),
                        }
                    }
                }));

            let subscription = session.subscribe(&sink, event, class)?;
            println!("Watching {} ({}), press Ctrl-C to stop", class, event);

            // Install Ctrl+C handler
            let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
            let r = running.clone();
            ctrlc::set_handler(move || {
                r.store(false, std::sync::atomic::Ordering::SeqCst);
            })?;

            while running.load(std::sync::atomic::Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(200));
            }

            drop(subscription);
            println!("Stopped watching {}", class);
        }
    }

    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI features not enabled. Please compile with --features cli");
    std::process::exit(1);
}
