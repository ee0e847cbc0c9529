// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! memglass-shm-viewer - Inspect memglass shared-memory sessions
//!
//! Scans /dev/shm for memglass header objects, attaches read-only, and
//! prints session, type, and object summaries.

use clap::Parser;
use colored::*;
use memglass::{Observer, Primitive};
use std::fs;
use std::path::Path;

/// Inspect memglass shared-memory sessions
#[derive(Parser, Debug)]
#[command(name = "memglass-shm-viewer")]
#[command(version = "0.1.0")]
#[command(about = "Inspect memglass shared-memory sessions")]
struct Args {
    /// Show registered types and their field tables
    #[arg(short = 't', long)]
    types: bool,

    /// Show per-field values for every live object
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Output format: pretty, json
    #[arg(short, long, default_value = "pretty")]
    format: OutputFormat,

    /// Specific session name to inspect (default: all sessions found)
    #[arg()]
    session: Option<String>,
}

#[derive(Clone, Debug)]
enum OutputFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "p" => Ok(OutputFormat::Pretty),
            "json" | "j" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let sessions = match &args.session {
        Some(name) => vec![name.clone()],
        None => scan_sessions()?,
    };

    if sessions.is_empty() {
        println!("{}", "No memglass sessions found".yellow());
        return Ok(());
    }

    for (i, session) in sessions.iter().enumerate() {
        let mut observer = Observer::new(session.as_str());
        if let Err(e) = observer.connect() {
            eprintln!("{} {session}: {e}", "skipping".yellow());
            continue;
        }
        match args.format {
            OutputFormat::Pretty => {
                if i > 0 {
                    println!();
                }
                print_pretty(session, &observer, args);
            }
            OutputFormat::Json => print_json(session, &observer),
        }
    }

    Ok(())
}

/// Find session names from header objects in /dev/shm.
fn scan_sessions() -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let shm_dir = Path::new("/dev/shm");
    if !shm_dir.exists() {
        return Err("Shared memory directory /dev/shm not found".into());
    }

    let mut sessions = Vec::new();
    for entry in fs::read_dir(shm_dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(session) = name
            .strip_prefix("memglass_")
            .and_then(|rest| rest.strip_suffix("_header"))
        {
            sessions.push(session.to_string());
        }
    }
    sessions.sort();
    Ok(sessions)
}

fn print_pretty(session: &str, observer: &Observer, args: &Args) {
    println!("{}", format!("=== session {session} ===").bold());
    println!(
        "  producer pid {}  sequence {}  regions {:?}",
        observer.producer_pid().to_string().cyan(),
        observer.sequence(),
        observer.region_ids()
    );

    if args.types {
        println!();
        println!("  {}", "types".bold());
        for ty in observer.types() {
            println!(
                "    {} (id 0x{:x}, {} bytes, align {})",
                ty.name.green(),
                ty.type_id,
                ty.size,
                ty.alignment
            );
            for field in &ty.fields {
                let kind = Primitive::from_id(field.type_id)
                    .map(|p| format!("{p:?}"))
                    .unwrap_or_else(|| format!("user:0x{:x}", field.type_id));
                let array = if field.is_array() {
                    format!("[{}]", field.array_len)
                } else {
                    String::new()
                };
                println!(
                    "      +{:<4} {:<24} {kind}{array} {:?}",
                    field.offset,
                    field.name_str(),
                    field.atomicity()
                );
            }
        }
    }

    let objects = observer.objects();
    println!();
    println!("  {} ({} live)", "objects".bold(), objects.len());
    for info in &objects {
        println!(
            "    {} {} (region {}, offset {})",
            info.label.cyan(),
            info.type_name.green(),
            info.region_id,
            info.offset
        );

        if args.verbose {
            let Some(view) = observer.get(info) else {
                continue;
            };
            let Some(ty) = observer.types().iter().find(|t| t.type_id == info.type_id) else {
                continue;
            };
            for field in &ty.fields {
                let name = field.name_str();
                let proxy = view.field(name);
                if field.is_array() && field.type_id == Primitive::Char as u32 {
                    if let Some(s) = proxy.read_cstr() {
                        println!("      {name} = {s:?}");
                    }
                } else if field.is_array() {
                    let values: Vec<String> = (0..field.array_len as usize)
                        .filter_map(|i| proxy.index(i).value())
                        .map(|v| v.to_string())
                        .collect();
                    println!("      {name} = [{}]", values.join(", "));
                } else if let Some(value) = proxy.value() {
                    println!("      {name} = {value}");
                }
            }
        }
    }
}

fn print_json(session: &str, observer: &Observer) {
    print!(
        "{{\"session\":\"{}\",\"producer_pid\":{},\"sequence\":{},\"regions\":{:?},\"objects\":[",
        session,
        observer.producer_pid(),
        observer.sequence(),
        observer.region_ids()
    );

    for (i, info) in observer.objects().iter().enumerate() {
        if i > 0 {
            print!(",");
        }
        print!(
            "{{\"label\":\"{}\",\"type\":\"{}\",\"region\":{},\"offset\":{}}}",
            info.label.replace('"', "\\\""),
            info.type_name.replace('"', "\\\""),
            info.region_id,
            info.offset
        );
    }

    println!("]}}");
}
