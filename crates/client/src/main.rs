use std::fs::File;
use std::io::BufReader;

use dtx_client::{DelimitedParser, Engine, Ingestor, JsonLinesParser, RecordParser};
use dtx_common::{EngineConfig, Location};
use dtx_storage::Catalog;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    match args.first().map(|a| a.as_str()) {
        Some("ingest") => {
            let opts = parse_ingest_opts(&args)?;
            run_ingest(opts).await
        }
        Some("--help" | "-h") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => Err(format!("unknown command: {other}").into()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Csv,
    JsonLines,
}

#[derive(Debug, Clone)]
struct IngestOpts {
    catalog: String,
    table: String,
    file: String,
    format: Format,
    delimiter: char,
    header: bool,
    nodes: Vec<Location>,
}

fn parse_ingest_opts(args: &[String]) -> Result<IngestOpts, Box<dyn std::error::Error>> {
    let mut catalog = None;
    let mut table = None;
    let mut file = None;
    let mut format = Format::Csv;
    let mut delimiter = ',';
    let mut header = false;
    let mut nodes = vec![Location::new("127.0.0.1", 7000)];

    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--catalog" => {
                i += 1;
                catalog = Some(args.get(i).cloned().ok_or("missing value for --catalog")?);
            }
            "--table" => {
                i += 1;
                table = Some(args.get(i).cloned().ok_or("missing value for --table")?);
            }
            "--file" => {
                i += 1;
                file = Some(args.get(i).cloned().ok_or("missing value for --file")?);
            }
            "--format" => {
                i += 1;
                format = match args.get(i).map(|s| s.as_str()) {
                    Some("csv") => Format::Csv,
                    Some("jsonl") => Format::JsonLines,
                    Some(other) => return Err(format!("unknown format: {other}").into()),
                    None => return Err("missing value for --format".into()),
                };
            }
            "--delimiter" => {
                i += 1;
                let raw = args.get(i).ok_or("missing value for --delimiter")?;
                let mut chars = raw.chars();
                delimiter = match (chars.next(), chars.next()) {
                    (Some(c), None) => c,
                    _ => return Err(format!("delimiter must be one character: {raw}").into()),
                };
            }
            "--header" => {
                header = true;
            }
            "--nodes" => {
                i += 1;
                let raw = args.get(i).ok_or("missing value for --nodes")?;
                nodes = raw
                    .split(',')
                    .map(parse_location)
                    .collect::<Result<Vec<_>, _>>()?;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument for ingest: {other}").into()),
        }
        i += 1;
    }

    Ok(IngestOpts {
        catalog: catalog.ok_or("--catalog is required")?,
        table: table.ok_or("--table is required")?,
        file: file.ok_or("--file is required")?,
        format,
        delimiter,
        header,
        nodes,
    })
}

fn parse_location(raw: &str) -> Result<Location, Box<dyn std::error::Error>> {
    let (host, port) = raw
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| format!("node must be host:port: {raw}"))?;
    Ok(Location::new(host, port.parse()?))
}

async fn run_ingest(opts: IngestOpts) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::from_env()?;
    let batch_rows = config.ingest_batch_rows;
    let engine = Engine::new(Catalog::load_from_json(&opts.catalog)?, opts.nodes, config)?;
    let table = engine.catalog().get(&opts.table)?;
    let parser: Box<dyn RecordParser> = match opts.format {
        Format::Csv => Box::new(DelimitedParser::new(opts.delimiter, opts.header)),
        Format::JsonLines => Box::new(JsonLinesParser::for_schema(&table.schema)),
    };
    let sink = engine.sink(&opts.table)?;
    let ingestor = Ingestor::new(&table.name, &table.schema, &sink, batch_rows);
    let input = BufReader::new(File::open(&opts.file)?);
    let report = ingestor.ingest(parser.as_ref(), input).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!(
        "  dtx ingest --catalog <json> --table <name> --file <path> [--format csv|jsonl] \
         [--delimiter ,] [--header] [--nodes host:port,...]"
    );
    eprintln!();
    eprintln!("Environment: DTX_* overrides engine settings, RUST_LOG sets the log filter.");
}
