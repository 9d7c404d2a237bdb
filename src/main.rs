// refsim: value/reference semantics simulator driver

use std::fs;
use std::path::Path;

use refsim::config::SimConfig;
use refsim::escape::EscapeMode;
use refsim::interpreter::engine::Simulator;

fn usage(program_name: &str) {
    eprintln!("Usage: {} <program.json> [options]", program_name);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --interprocedural   Use per-parameter leak summaries for calls");
    eprintln!("  --entry NAME        Entry function (default: main)");
    eprintln!("  --config FILE       Load a JSON SimConfig; flags override it");
    eprintln!("  --heap              Also print the heap report");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let args: Vec<String> = std::env::args().collect();
    let program_name = args.first().map(|s| s.as_str()).unwrap_or("refsim");

    let mut path = None;
    let mut config_path = None;
    let mut entry = None;
    let mut interprocedural = false;
    let mut show_heap = false;

    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--interprocedural" => interprocedural = true,
            "--heap" => show_heap = true,
            "--entry" => entry = rest.next().cloned(),
            "--config" => config_path = rest.next().cloned(),
            "-h" | "--help" => {
                usage(program_name);
                return Ok(());
            }
            other if path.is_none() && !other.starts_with("--") => path = Some(other.to_string()),
            other => {
                eprintln!("Error: unexpected argument '{}'", other);
                usage(program_name);
                std::process::exit(2);
            }
        }
    }

    let Some(path) = path else {
        eprintln!("Error: No input file provided");
        eprintln!();
        usage(program_name);
        std::process::exit(1);
    };

    if !Path::new(&path).exists() {
        eprintln!("Error: File '{}' not found", path);
        std::process::exit(1);
    }

    let mut config = match config_path {
        Some(config_path) => SimConfig::from_json(&fs::read_to_string(config_path)?)?,
        None => SimConfig::default(),
    };
    if let Some(entry) = entry {
        config = config.with_entry(entry);
    }
    if interprocedural {
        config = config.with_escape_mode(EscapeMode::Interprocedural);
    }

    let json = fs::read_to_string(&path)?;
    let mut simulator = match Simulator::from_json(&json, config) {
        Ok(simulator) => simulator,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match simulator.run() {
        Ok(verdict) => {
            println!("{}", verdict.to_json()?);
            if verdict.panicked() {
                eprintln!("Trace ended by {} panic(s).", verdict.panics.len());
            }
        }
        Err(e) => {
            eprintln!("Runtime error: {}", e);
            std::process::exit(1);
        }
    }

    if show_heap {
        println!("{}", serde_json::to_string_pretty(&simulator.heap_report())?);
    }

    Ok(())
}
