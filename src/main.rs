//! Marten - Embedded LSM-Tree Key-Value Storage Engine
//! Interactive shell for poking at a local database directory.

use std::io::{self, BufRead, Write};

use marten::{Config, Marten};

fn main() {
    env_logger::init();

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║          MARTEN Storage Engine            ║");
    println!("  ║       LSM-Tree Key-Value Store v0.3       ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    println!("  Commands:");
    println!("    set <key> <value>  - Store a key-value pair");
    println!("    get <key>          - Retrieve a value by key");
    println!("    del <key>          - Delete a key");
    println!("    scan               - List all key-value pairs");
    println!("    flush              - Persist the memtable to a segment");
    println!("    compact            - Flush and merge all segments");
    println!("    info               - Show engine statistics");
    println!("    exit               - Shutdown engine");
    println!();

    let config = Config::default();
    let engine = match Marten::open(config) {
        Ok(e) => e,
        Err(err) => {
            eprintln!("[ERROR] Failed to open engine: {}", err);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("marten> ");
        stdout.flush().unwrap();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap() == 0 {
            break; // EOF
        }

        let parts: Vec<&str> = line.trim().split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0].to_lowercase().as_str() {
            "set" | "put" => {
                if parts.len() < 3 {
                    println!("  Usage: set <key> <value>");
                    continue;
                }
                let key = parts[1].as_bytes().to_vec();
                let value = parts[2..].join(" ").as_bytes().to_vec();
                match engine.set(key, value) {
                    Ok(()) => println!("  OK"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "get" => {
                if parts.len() < 2 {
                    println!("  Usage: get <key>");
                    continue;
                }
                match engine.get(parts[1].as_bytes()) {
                    Ok(Some(value)) => match String::from_utf8(value) {
                        Ok(s) => println!("  \"{}\"", s),
                        Err(_) => println!("  <binary data>"),
                    },
                    Ok(None) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "del" | "delete" => {
                if parts.len() < 2 {
                    println!("  Usage: del <key>");
                    continue;
                }
                let key = parts[1].as_bytes().to_vec();
                match engine.delete(key) {
                    Ok(()) => println!("  OK (deleted)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "scan" | "list" => match engine.scan() {
                Ok(entries) => {
                    if entries.is_empty() {
                        println!("  (empty)");
                    } else {
                        for (key, value) in &entries {
                            let k = String::from_utf8_lossy(key);
                            let v = String::from_utf8_lossy(value);
                            println!("  {} -> {}", k, v);
                        }
                        println!("  ({} entries)", entries.len());
                    }
                }
                Err(e) => println!("  ERROR: {}", e),
            },
            "flush" => match engine.flush() {
                Ok(()) => println!("  OK ({} segments)", engine.segment_count()),
                Err(e) => println!("  ERROR: {}", e),
            },
            "compact" => match engine.force_compact() {
                Ok(()) => println!("  OK ({} segments)", engine.segment_count()),
                Err(e) => println!("  ERROR: {}", e),
            },
            "info" | "stats" => {
                println!("  Segments:      {}", engine.segment_count());
                println!("  MemTable size: {} bytes", engine.memtable_size());
                println!("{}", engine.metrics().report());
            }
            "exit" | "quit" | "q" => {
                println!("  Shutting down Marten...");
                if let Err(e) = engine.close() {
                    eprintln!("[ERROR] Shutdown failed: {}", e);
                }
                break;
            }
            _ => {
                println!("  Unknown command: '{}'. Type 'exit' to quit.", parts[0]);
            }
        }
    }
}
