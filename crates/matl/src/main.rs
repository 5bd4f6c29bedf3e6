use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use matl_client::api::ApiClient;
use matl_client::docs;
use matl_client::encoder::{self, PasteFormat, StringEncoding};
use matl_client::media::DataUri;
use matl_client::permalink::Permalink;
use matl_client::{load_config, resolve_version, ClientConfig, ClientHandle, RunRequest};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};
use url::Url;

mod render;

use crate::render::{format_elapsed, save_media, StreamPrinter};

#[derive(Parser)]
#[command(name = "matl", author, version, about = "Run MATL programs on MATL Online")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server base URL (overrides config and MATL_ONLINE_URL)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Config file (default: <config dir>/matl-online/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program and stream its output (Ctrl-C cancels it)
    Run {
        /// Source code
        #[arg(long, short, conflicts_with = "file")]
        code: Option<String>,
        /// Read the source code from a file
        #[arg(long, short)]
        file: Option<PathBuf>,
        /// Input arguments, one per line
        #[arg(long, short, default_value = "")]
        inputs: String,
        /// Interpreter version
        #[arg(long = "version", short = 'V')]
        matl_version: Option<String>,
        /// Write images and audio to this directory
        #[arg(long)]
        media_dir: Option<PathBuf>,
        /// Print the final output as JSON instead of streaming it
        #[arg(long)]
        json: bool,
    },
    /// Explain what a program does
    Explain {
        /// Source code
        #[arg(long, short)]
        code: String,
        /// Interpreter version
        #[arg(long = "version", short = 'V')]
        matl_version: Option<String>,
    },
    /// Show the function reference for a version
    Help {
        /// Interpreter version
        matl_version: Option<String>,
        /// Filter: a function name, or words that must all appear
        #[arg(long, short)]
        search: Option<String>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Convert pasted data into a MATL literal (reads stdin when TEXT is omitted)
    Encode {
        /// Treat the input as nested arrays
        #[arg(long, conflicts_with = "string")]
        array: bool,
        /// Treat the input as lines of text
        #[arg(long)]
        string: bool,
        /// Pad lines to equal length
        #[arg(long, requires = "string")]
        pad: bool,
        /// Append the result to these existing inputs
        #[arg(long)]
        append_to: Option<String>,
        text: Option<String>,
    },
    /// Build a permalink, or read one back
    Link {
        #[arg(long, short)]
        code: Option<String>,
        #[arg(long, short, default_value = "")]
        inputs: String,
        #[arg(long = "version", short = 'V')]
        matl_version: Option<String>,
        /// Parse this link instead of building one
        #[arg(long, conflicts_with = "code")]
        parse: Option<String>,
    },
    /// Upload an image and print a shareable link
    Share {
        /// Image file or data URI
        source: String,
    },
}

#[derive(Tabled)]
struct HelpTableRow {
    #[tabled(rename = "SOURCE")]
    source: String,
    #[tabled(rename = "BRIEF")]
    brief: String,
    #[tabled(rename = "ARGUMENTS")]
    arguments: String,
}

#[derive(Serialize)]
struct LinkInfo {
    code: String,
    inputs: String,
    version: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    info!("Using server {}", config.server_url);

    match cli.command {
        Commands::Run {
            code,
            file,
            inputs,
            matl_version,
            media_dir,
            json,
        } => {
            let code = match (code, file) {
                (Some(code), _) => code,
                (None, Some(file)) => std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?,
                (None, None) => bail!("Nothing to run: pass --code or --file"),
            };
            let version = resolve_version(matl_version.as_deref(), &config);
            run_program(&config, code, inputs, version, media_dir, json).await
        }
        Commands::Explain { code, matl_version } => {
            let api = ApiClient::from_config(&config)?;
            let version = resolve_version(matl_version.as_deref(), &config);
            match api.explain(&code, &version).await {
                Ok(Some(text)) => println!("{}", text),
                Ok(None) => {}
                Err(e) => bail!("SERVER ERROR: {}", e),
            }
            Ok(())
        }
        Commands::Help {
            matl_version,
            search,
            json,
        } => {
            let version = resolve_version(matl_version.as_deref(), &config);
            show_help(&config, &version, search.as_deref().unwrap_or(""), json).await
        }
        Commands::Encode {
            array,
            string,
            pad,
            append_to,
            text,
        } => {
            let text = match text {
                Some(text) => text,
                None => read_stdin()?,
            };
            let format = if array {
                PasteFormat::Array
            } else if string {
                PasteFormat::String
            } else {
                encoder::detect_format(&text)
            };
            let encoded = encoder::encode(&text, format, StringEncoding { pad })?;
            match append_to {
                Some(existing) => println!("{}", encoder::append_input(&existing, &encoded)),
                None => println!("{}", encoded),
            }
            Ok(())
        }
        Commands::Link {
            code,
            inputs,
            matl_version,
            parse,
        } => {
            if let Some(link) = parse {
                let url = Url::parse(&link).with_context(|| format!("Invalid link {}", link))?;
                let parsed = Permalink::from_url(&url);
                let info = LinkInfo {
                    code: parsed.code,
                    inputs: parsed.inputs,
                    version: parsed.version,
                };
                println!("{}", serde_json::to_string_pretty(&info)?);
                return Ok(());
            }

            let code = code.ok_or_else(|| anyhow!("Pass --code, or --parse a link"))?;
            let version = resolve_version(matl_version.as_deref(), &config);
            let base = config.server_url()?;
            println!("{}", Permalink::new(code, inputs, Some(version)).to_url(&base));
            Ok(())
        }
        Commands::Share { source } => {
            let image = image_source(&source)?;
            let api = ApiClient::from_config(&config)?;
            match api.share(&image).await {
                Ok(link) => println!("{}", link),
                Err(e) => bail!("SERVER ERROR: {}", e),
            }
            Ok(())
        }
    }
}

fn read_stdin() -> Result<String> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        eprintln!("Reading input from stdin (Ctrl-D to finish)...");
    }
    let mut text = String::new();
    stdin.read_to_string(&mut text)?;
    Ok(text.strip_suffix('\n').unwrap_or(&text).to_string())
}

/// A data URI is used as is; anything else is read as an image file.
fn image_source(source: &str) -> Result<String> {
    if source.starts_with("data:") {
        DataUri::parse(source)?;
        return Ok(source.to_string());
    }

    let path = PathBuf::from(source);
    let bytes =
        std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mime = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        _ => bail!("Unsupported image type: {}", path.display()),
    };
    Ok(DataUri {
        mime: mime.to_string(),
        bytes,
    }
    .to_uri())
}

async fn show_help(config: &ClientConfig, version: &str, search: &str, json: bool) -> Result<()> {
    let mut api = ApiClient::from_config(config)?;
    let entries = match api.help(version).await {
        Ok(entries) => entries,
        Err(e) => bail!("SERVER ERROR: {}", e),
    };
    let found = docs::search(&entries, search);

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }

    if found.is_empty() {
        println!("No matching functions");
        return Ok(());
    }

    let rows: Vec<HelpTableRow> = found
        .iter()
        .map(|entry| HelpTableRow {
            source: entry.source.clone(),
            brief: entry.brief.clone(),
            arguments: entry.arguments.clone(),
        })
        .collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

async fn run_program(
    config: &ClientConfig,
    code: String,
    inputs: String,
    version: String,
    media_dir: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let client = ClientHandle::connect(config)?;
    let request = RunRequest::new(code, inputs, version).with_debug(config.debug.clone());

    let started = Instant::now();
    if !client.submit(request).await? {
        bail!("Nothing to run");
    }

    let mut views = client.watch();
    let mut printer = StreamPrinter::new(!json);

    let view = loop {
        let view = views.borrow_and_update().clone();
        printer.update(&view.output)?;
        if view.is_idle() {
            break view;
        }

        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    bail!("Client stopped unexpectedly");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling...");
                client.cancel()?;
            }
        }
    };

    let _ = client.shutdown();
    eprintln!("Finished in {}", format_elapsed(started.elapsed()));

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        printer.finish(&view.output)?;
        if view.output.has_errors {
            eprintln!("{}", view.output.error_text());
        }
    }

    if let Some(notice) = &view.notice {
        eprintln!("{}", notice);
    }

    if let Some(dir) = media_dir {
        for path in save_media(&view.output, &dir)? {
            eprintln!("Saved {}", path.display());
        }
    }

    if view.output.has_errors && !json {
        std::process::exit(1);
    }
    Ok(())
}
