//! Example: Download the 3DEP DEM for a bounding box.
//!
//! Usage: cargo run --example fetch_dem -- <west> <south> <east> <north> [resolution] [save_dir] [map_type]
//!
//! Set `SEAMLESS_DEM_CONFIG` to a YAML file to override the download settings,
//! and `RUST_LOG=seamless_dem=debug` for per-tile logs. Ctrl-C cancels the
//! download; tiles already written are kept.

use seamless_dem::{BoundingBox, CancellationToken, DemDownloader, DemProduct, FetchConfig};
use std::env;
use std::path::Path;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 5 {
        eprintln!(
            "Usage: {} <west> <south> <east> <north> [resolution] [save_dir] [map_type]",
            args[0]
        );
        eprintln!("Example: {} -105.70 39.85 -104.87 40.30 10 ./dem_data", args[0]);
        std::process::exit(1);
    }

    let coord = |i: usize| -> f64 { args[i].parse().expect("Invalid coordinate") };
    let bbox = BoundingBox::new(coord(1), coord(2), coord(3), coord(4)).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });
    let meters: u32 = args
        .get(5)
        .map(|s| s.parse().expect("Invalid resolution"))
        .unwrap_or(30);
    let save_dir = args.get(6).map(|s| s.as_str()).unwrap_or("dem_data");
    let map_type = args.get(7);

    let product = DemProduct::from_meters(meters).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    let config = match env::var("SEAMLESS_DEM_CONFIG") {
        Ok(path) => FetchConfig::from_file(&path).expect("Failed to load config"),
        Err(_) => FetchConfig::default(),
    };

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("Cancelling...");
        handler_token.cancel();
    })
    .expect("Failed to install Ctrl-C handler");

    let downloader = DemDownloader::new(config).expect("Invalid configuration");

    println!("Downloading {} DEM for {} into {}...", product, bbox, save_dir);
    let start = Instant::now();

    let result = match map_type {
        Some(map) => downloader.get_map(map, &bbox, Path::new(save_dir), product, &cancel),
        None => downloader.get(&bbox, Path::new(save_dir), product, &cancel),
    };

    match result {
        Ok(report) => {
            println!(
                "Downloaded {} tiles in {:.1}s",
                report.total(),
                start.elapsed().as_secs_f64()
            );
            for path in report.paths() {
                println!("  {}", path.display());
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            let usable = e.usable_paths();
            if !usable.is_empty() {
                eprintln!("{} tiles are usable:", usable.len());
                for path in usable {
                    eprintln!("  {}", path.display());
                }
            }
            // `exit` skips destructors
            seamless_dem::pool::release_all();
            std::process::exit(1);
        }
    }

    let released = downloader.shutdown();
    println!("Released {} pooled resources", released);
}
