//! CELLAR - Interactive Shell
//! A line-oriented shell over the storage facade. The data directory is the
//! first argument (default `./cellar-data`); `RUST_LOG` controls logging.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};

use cellar::{LogEngine, Storage, StorageConfig};

fn main() {
    env_logger::init();

    let data_dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./cellar-data".to_string());

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║            CELLAR Storage Shell           ║");
    println!("  ║   Versioned Embedded Key-Value Store      ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    println!("  Commands:");
    println!("    set <key> <value> [ttl]      - Store a value");
    println!("    get <key>                    - Show value, ttl and version");
    println!("    cas <key> <version> <value>  - Compare-and-set");
    println!("    incr <key> [delta]           - Increment a counter");
    println!("    del <key>                    - Delete a key");
    println!("    scan [prefix]                - List entries under a prefix");
    println!("    keys [prefix]                - List keys under a prefix");
    println!("    compact [ratio]              - Reclaim value-log space");
    println!("    backup <file> [since]        - Write a backup stream");
    println!("    restore <file>               - Load a backup stream");
    println!("    drop [prefix]                - Drop a prefix or everything");
    println!("    info                         - Show engine statistics");
    println!("    exit                         - Close the store");
    println!();

    let config = StorageConfig::new(&data_dir);
    let storage = match Storage::new("shell", &config) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("[ERROR] Failed to open storage at {}: {}", data_dir, err);
            std::process::exit(1);
        }
    };
    log::info!("shell opened {}", data_dir);

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("cellar> ");
        if stdout.flush().is_err() {
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break, // EOF
            Ok(_) => {}
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0].to_lowercase().as_str() {
            "exit" | "quit" | "q" => {
                println!("  Shutting down CELLAR...");
                break;
            }
            command => {
                if let Err(err) = run_command(&storage, command, &parts[1..]) {
                    println!("  ERROR: {}", err);
                }
            }
        }
    }

    if let Err(err) = storage.close() {
        eprintln!("[ERROR] Failed to close storage: {}", err);
        std::process::exit(1);
    }
}

fn run_command(storage: &Storage<LogEngine>, command: &str, args: &[&str]) -> cellar::Result<()> {
    match command {
        "set" | "put" => {
            if args.len() < 2 {
                println!("  Usage: set <key> <value> [ttl]");
                return Ok(());
            }
            let ttl = args.get(2).and_then(|t| t.parse().ok()).unwrap_or(0);
            storage
                .set()
                .by_key(args[0])
                .with_value(args[1])
                .with_ttl(ttl)
                .execute()?;
            println!("  OK");
        }
        "get" => {
            let Some(key) = args.first() else {
                println!("  Usage: get <key>");
                return Ok(());
            };
            match storage.get().by_key(key).to_entry()? {
                Some(entry) => println!(
                    "  \"{}\" (ttl {}, version {})",
                    String::from_utf8_lossy(&entry.value),
                    entry.ttl,
                    entry.version
                ),
                None => println!("  (nil)"),
            }
        }
        "cas" => {
            let version = args.get(1).and_then(|v| v.parse::<i64>().ok());
            let (Some(key), Some(version), Some(value)) = (args.first(), version, args.get(2)) else {
                println!("  Usage: cas <key> <version> <value>");
                return Ok(());
            };
            let applied = storage
                .compare_and_set()
                .by_key(key)
                .with_value(value)
                .with_version(version)
                .execute()?;
            println!("  {}", if applied { "OK (applied)" } else { "NOT APPLIED" });
        }
        "incr" => {
            let Some(key) = args.first() else {
                println!("  Usage: incr <key> [delta]");
                return Ok(());
            };
            let delta = args.get(1).and_then(|d| d.parse().ok()).unwrap_or(1);
            let value = storage.increment().by_key(key).with_delta(delta).execute()?;
            println!("  {}", value);
        }
        "del" | "delete" => {
            let Some(key) = args.first() else {
                println!("  Usage: del <key>");
                return Ok(());
            };
            storage.remove().by_key(key).execute()?;
            println!("  OK (deleted)");
        }
        "scan" | "list" => {
            let prefix = args.first().copied().unwrap_or("");
            let mut count = 0;
            storage.enumerate().with_prefix(prefix).for_each(|entry| {
                println!(
                    "  {} -> {} (v{})",
                    String::from_utf8_lossy(&entry.key),
                    String::from_utf8_lossy(&entry.value),
                    entry.version
                );
                count += 1;
                true
            })?;
            if count == 0 {
                println!("  (empty)");
            } else {
                println!("  ({} entries)", count);
            }
        }
        "keys" => {
            let prefix = args.first().copied().unwrap_or("");
            let keys = storage.fetch_keys_raw(prefix.as_bytes(), 0)?;
            for key in &keys {
                println!("  {}", String::from_utf8_lossy(key));
            }
            println!("  ({} keys)", keys.len());
        }
        "compact" => {
            let ratio = args.first().and_then(|r| r.parse().ok()).unwrap_or(0.5);
            let mut rounds = 0;
            while storage.compact(ratio)? {
                rounds += 1;
            }
            println!("  OK ({} segments reclaimed)", rounds);
        }
        "backup" => {
            let Some(path) = args.first() else {
                println!("  Usage: backup <file> [since]");
                return Ok(());
            };
            let since = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
            let mut sink = BufWriter::new(File::create(path)?);
            let next = storage.backup(&mut sink, since)?;
            sink.flush()?;
            println!("  OK (next since = {})", next);
        }
        "restore" => {
            let Some(path) = args.first() else {
                println!("  Usage: restore <file>");
                return Ok(());
            };
            let mut source = BufReader::new(File::open(path)?);
            storage.restore(&mut source)?;
            println!("  OK (restored)");
        }
        "drop" => match args.first() {
            Some(prefix) => {
                storage.drop_with_prefix(prefix.as_bytes())?;
                println!("  OK (dropped prefix '{}')", prefix);
            }
            None => {
                storage.drop_all()?;
                println!("  OK (dropped everything)");
            }
        },
        "info" | "stats" => {
            let engine = storage.engine();
            println!("  Keys:          {}", engine.key_count());
            println!("  Last version:  {}", engine.last_version());
            println!("  Memory:        {} bytes", engine.memory_bytes());
            println!("  Segments:      {}", engine.segment_count());
            println!("  Open txns:     {}", engine.open_transactions());
            println!("{}", engine.metrics().report());
        }
        other => {
            println!("  Unknown command: '{}'. Type 'exit' to quit.", other);
        }
    }
    Ok(())
}
