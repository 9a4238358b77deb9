//! Read a span of a remote image through a persistent block cache.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin streamdisk -- --url https://images.example.com/win7.img --image-id win7 --image-version sp1 --offset 0 --length 512
//! ```
//!
//! Blocks are cached under `--cache-dir` (in a directory named after the image identity) so that
//! a second run over the same span issues no block requests. Pass `--backend memory` to cache in
//! memory only, or `--clear` to discard the cache before reading.
//!
//! Signed URLs and `--header Authorization:...` credentials are never logged: the URL is logged
//! without its query string and only header names are printed.
//!
//! Set `RUST_LOG=debug` to observe every download, hit, and eviction.

use clap::{value_parser, Arg, ArgAction, Command};
use prometheus_client::{encoding::text::encode, registry::Registry};
use reqwest::Url;
use reqwest::header::HeaderMap;
use std::{env, path::PathBuf};
use streamdisk::{
    client::{parse_header, redact, Client, Http},
    remote::{Config, Disk, Identity},
    Error,
};
use streamdisk_storage::store::{
    directory::Directory,
    kv::{Kv, Memory},
    Store,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Bytes per line of the hex preview.
const PREVIEW_WIDTH: usize = 16;

/// Longest preview printed.
const PREVIEW_LIMIT: usize = 256;

struct Request {
    offset: u64,
    length: usize,
    clear: bool,
}

fn preview(offset: u64, data: &[u8]) {
    for (i, line) in data.chunks(PREVIEW_WIDTH).enumerate() {
        let hex = line
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        let text = line
            .iter()
            .map(|byte| match byte {
                0x20..=0x7e => *byte as char,
                _ => '.',
            })
            .collect::<String>();
        let at = offset + (i * PREVIEW_WIDTH) as u64;
        println!("{at:016x}  {hex:<47}  {text}");
    }
}

async fn run<S: Store, C: Client>(
    client: C,
    store: S,
    config: Config,
    request: Request,
) -> Result<(), Error> {
    let disk = Disk::open(client, store, config).await?;
    let mut registry = Registry::default();
    disk.register(&mut registry);
    if request.clear {
        disk.clear().await?;
    }
    let cached = disk.cached_bytes().await;
    info!(
        size = disk.size(),
        etag = ?disk.probe().etag,
        cached,
        "opened remote image"
    );

    // Read the requested span
    let length = request
        .length
        .min(disk.size().saturating_sub(request.offset) as usize);
    let data = disk.read(request.offset, length).await?;
    preview(request.offset, &data[..data.len().min(PREVIEW_LIMIT)]);
    if data.len() > PREVIEW_LIMIT {
        println!("... {} more bytes", data.len() - PREVIEW_LIMIT);
    }

    // Report
    println!("{:#?}", disk.telemetry().await);
    let mut buffer = String::new();
    if encode(&mut buffer, &registry).is_ok() {
        print!("{buffer}");
    }
    disk.close().await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Parse arguments
    let matches = Command::new("streamdisk")
        .about("read a remote image through a persistent block cache")
        .arg(
            Arg::new("url")
                .long("url")
                .required(true)
                .value_parser(value_parser!(Url))
                .help("Range-capable URL of the image"),
        )
        .arg(
            Arg::new("cache-dir")
                .long("cache-dir")
                .value_parser(value_parser!(PathBuf))
                .help("Directory holding cached blocks"),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .default_value("directory")
                .value_parser(["directory", "memory"]),
        )
        .arg(
            Arg::new("image-id")
                .long("image-id")
                .help("Stable identifier of the image (defaults to the URL without its query)"),
        )
        .arg(
            Arg::new("image-version")
                .long("image-version")
                .default_value("latest"),
        )
        .arg(
            Arg::new("chunk-size")
                .long("chunk-size")
                .default_value("1048576")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("cache-limit")
                .long("cache-limit")
                .value_parser(value_parser!(u64))
                .help("Target for cached bytes (unbounded if omitted)"),
        )
        .arg(
            Arg::new("prefetch")
                .long("prefetch")
                .default_value("2")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("max-concurrent-fetches")
                .long("max-concurrent-fetches")
                .default_value("4")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("header")
                .long("header")
                .action(ArgAction::Append)
                .help("Extra request header as NAME:VALUE (repeatable)"),
        )
        .arg(
            Arg::new("offset")
                .long("offset")
                .default_value("0")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("length")
                .long("length")
                .default_value("512")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("clear")
                .long("clear")
                .action(ArgAction::SetTrue)
                .help("Discard the cache before reading"),
        )
        .get_matches();

    // Create logger
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Configure the image
    let url = matches
        .get_one::<Url>("url")
        .expect("Please provide url")
        .clone();
    let image_id = matches
        .get_one::<String>("image-id")
        .cloned()
        .unwrap_or_else(|| redact(&url).to_string());
    let version = matches
        .get_one::<String>("image-version")
        .expect("Please provide image version");
    let identity = Identity::new(image_id, version.as_str(), "range");
    let config = Config {
        chunk_size: *matches.get_one::<u64>("chunk-size").expect("Please provide chunk size"),
        cache_limit: matches.get_one::<u64>("cache-limit").copied(),
        prefetch: *matches.get_one::<usize>("prefetch").expect("Please provide prefetch"),
        max_concurrent_fetches: *matches
            .get_one::<usize>("max-concurrent-fetches")
            .expect("Please provide max concurrent fetches"),
        ..Config::new(identity.clone())
    };
    let request = Request {
        offset: *matches.get_one::<u64>("offset").expect("Please provide offset"),
        length: *matches.get_one::<usize>("length").expect("Please provide length"),
        clear: matches.get_flag("clear"),
    };

    // Header values may hold credentials, so only their names are logged
    let mut headers = HeaderMap::new();
    for raw in matches.get_many::<String>("header").into_iter().flatten() {
        let (name, value) = parse_header(raw)?;
        headers.insert(name, value);
    }
    let names = headers.keys().map(ToString::to_string).collect::<Vec<_>>();
    let client = Http::new(url).with_headers(headers);
    info!(
        url = %redact(client.url()),
        key = %identity.cache_key(),
        headers = ?names,
        "configured image"
    );

    // Run against the selected backend
    match matches.get_one::<String>("backend").map(String::as_str) {
        Some("memory") => {
            let store = Kv::init(Memory::default(), identity.cache_key()).await?;
            run(client, store, config, request).await
        }
        _ => {
            let root = matches
                .get_one::<PathBuf>("cache-dir")
                .cloned()
                .unwrap_or_else(|| env::temp_dir().join("streamdisk"))
                .join(identity.cache_key());
            let store = Directory::init(root).await?;
            info!(root = %store.root().display(), "caching in directory");
            run(client, store, config, request).await
        }
    }
}
