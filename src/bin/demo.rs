use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use libreadahead::{CacheConfig, CachedStream, ThrottledSource};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Use std::env for argument parsing
    let mut args = std::env::args().skip(1);
    let path = match args.next() {
        Some(val) => val,
        None => {
            eprintln!("Missing required argument: path");
            print_usage_and_exit();
        }
    };

    let mut memory_size: Option<usize> = None;
    let mut config_path: Option<String> = None;
    let mut throttle_kbps: u64 = 0;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--memory-size" => memory_size = Some(parse_number(&arg, args.next())),
            "--config" => match args.next() {
                Some(val) => config_path = Some(val),
                None => {
                    eprintln!("Expected a file after --config");
                    print_usage_and_exit();
                }
            },
            "--throttle-kbps" => throttle_kbps = parse_number(&arg, args.next()),
            _ => {
                eprintln!("Unknown argument: {}", arg);
                print_usage_and_exit();
            }
        }
    }

    let mut config = match config_path {
        Some(config_path) => load_config(&config_path),
        None => CacheConfig::default(),
    };
    if let Some(memory_size) = memory_size {
        config.memory_size = memory_size;
    }

    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open {}: {}", path, e);
            process::exit(1);
        }
    };
    let source = ThrottledSource::new(file).bytes_per_sec(throttle_kbps * 1024);

    info!(
        strategy = ?config.kind(),
        memory_size = config.memory_size,
        throttle_kbps,
        "Opening cached stream"
    );
    let mut stream = match CachedStream::new(source, config) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Could not create cached stream: {}", e);
            process::exit(1);
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    if let Err(e) = ctrlc::set_handler(move || stop_flag.store(true, Ordering::SeqCst)) {
        eprintln!("Failed to install Ctrl-C handler: {}", e);
    }

    let total = stream.len();
    println!("Source size: {} bytes", total);

    // Read forward, and every few chunks jump back to an earlier bookmark and
    // return, the access pattern the double cache is built for.
    let mut buf = vec![0u8; 64 * 1024];
    let mut bookmark = 0u64;
    let mut delivered = 0u64;
    let mut seeks = 0u32;
    let mut last_percent = 0;
    let mut chunk_index = 0u64;
    let start = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                eprintln!("\nRead failed at {}: {}", stream.position(), e);
                process::exit(1);
            }
        };
        delivered += n as u64;
        chunk_index += 1;

        if chunk_index % 64 == 0 {
            let resume = stream.position();
            let seek_start = Instant::now();
            if let Err(e) = seek_and_peek(&mut stream, bookmark, resume, &mut buf) {
                eprintln!("\nSeek ping-pong failed: {}", e);
                process::exit(1);
            }
            seeks += 2;
            info!(
                bookmark,
                resume,
                elapsed_ms = seek_start.elapsed().as_millis() as u64,
                "Seek ping-pong"
            );
            bookmark = resume;
        }

        let percent = if total > 0 { stream.position() * 100 / total } else { 100 };
        if percent != last_percent {
            print!(
                "\rProgress: {:3}% ({} bytes buffered ahead)",
                percent,
                stream.buffered()
            );
            let _ = std::io::stdout().flush();
            last_percent = percent;
        }
    }

    let elapsed = start.elapsed();
    println!();
    if stop.load(Ordering::SeqCst) {
        println!("Interrupted.");
    }
    let (cached_start, cached_end) = stream.cached_range();
    println!("Delivered {} bytes in {:.3} seconds ({:.2} MiB/s), {} seeks",
        delivered,
        elapsed.as_secs_f64(),
        if elapsed.as_secs_f64() > 0.0 { delivered as f64 / elapsed.as_secs_f64() / (1024.0 * 1024.0) } else { 0.0 },
        seeks
    );
    println!("Cached window at exit: {}..{}", cached_start, cached_end);
}

/// Seek to `bookmark`, read a little, then go back to `resume`.
fn seek_and_peek(stream: &mut CachedStream, bookmark: u64, resume: u64, buf: &mut [u8]) -> std::io::Result<()> {
    stream.seek(SeekFrom::Start(bookmark))?;
    let peek = buf.len().min(4096);
    let _ = stream.read(&mut buf[..peek])?;
    stream.seek(SeekFrom::Start(resume))?;
    Ok(())
}

fn load_config(path: &str) -> CacheConfig {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Failed to read config {}: {}", path, e);
            process::exit(1);
        }
    };
    match serde_json::from_str(&text) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid config {}: {}", path, e);
            process::exit(1);
        }
    }
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<String>) -> T {
    match value.as_deref().map(str::parse::<T>) {
        Some(Ok(num)) => num,
        _ => {
            eprintln!("{} expects a non-negative integer", flag);
            print_usage_and_exit();
        }
    }
}

fn print_usage_and_exit() -> ! {
    eprintln!("Usage: demo <path> [--memory-size BYTES] [--config FILE.json] [--throttle-kbps N]");
    process::exit(1);
}
