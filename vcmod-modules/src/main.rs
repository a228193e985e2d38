//! vcmod: run one vSphere automation module and print its result envelope.

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vcmod_core::{FileConfig, HttpConnector, execute, process_env};

#[derive(Parser)]
#[command(name = "vcmod", version)]
#[command(about = "Declarative vSphere automation modules", long_about = None)]
struct Cli {
    /// Connection defaults file (defaults to $VCMOD_CONFIG or ~/.config/vcmod/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a module and print its result as JSON
    Run {
        /// Module name, with or without the vmware_ prefix
        module: String,

        /// Arguments: inline JSON, a path to a JSON file, or '-' for stdin
        #[arg(default_value = "-")]
        args: String,
    },

    /// List available modules
    List,

    /// Print the argument schema of a module
    Schema {
        /// Module name
        module: String,
    },
}

#[derive(Tabled)]
struct ModuleRow {
    #[tabled(rename = "MODULE")]
    name: String,
    #[tabled(rename = "PARAMS")]
    params: usize,
    #[tabled(rename = "REQUIRED")]
    required: String,
}

async fn read_input(args: &str) -> Result<Value> {
    let text = if args == "-" {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .context("reading arguments from stdin")?;
        buf
    } else if args.trim_start().starts_with('{') {
        args.to_string()
    } else {
        tokio::fs::read_to_string(args)
            .await
            .with_context(|| format!("reading arguments from {args}"))?
    };
    serde_json::from_str(&text).context("arguments are not valid JSON")
}

fn list() {
    let rows: Vec<ModuleRow> = vcmod_modules::all()
        .iter()
        .map(|m| {
            let spec = m.argument_spec();
            let required: Vec<&str> = spec.params.iter().filter(|p| p.required).map(|p| p.name).collect();
            ModuleRow {
                name: m.name().to_string(),
                params: spec.params.len(),
                required: required.join(", "),
            }
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::blank());
    println!("{table}");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries only the envelope
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vcmod=info,vcmod_core=info,vcmod_modules=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => list(),
        Commands::Schema { module } => {
            let Some(m) = vcmod_modules::find(&module) else {
                bail!("unknown module '{module}'");
            };
            let spec = m.argument_spec().with_common();
            println!("{}", serde_json::to_string_pretty(&spec)?);
        }
        Commands::Run { module, args } => {
            let Some(m) = vcmod_modules::find(&module) else {
                bail!("unknown module '{module}'");
            };
            let input = read_input(&args).await?;
            let file = FileConfig::discover(cli.config.as_deref(), &process_env)?;
            let envelope = execute(m.as_ref(), input, &HttpConnector::new(), &file, &process_env).await;
            // A failed envelope is still a normal exit
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
    }

    Ok(())
}
