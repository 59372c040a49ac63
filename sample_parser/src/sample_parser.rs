use std::{
    env,
    fs::File,
    io::{stdin, Read},
    sync::Arc,
};

use charstack_parser::{Engine, Grammar, Logger, TraceEngine};
use sample_parser::{ARITH, KEYVAL};

// Chunk size for feeding the engine; small enough to show that parses
// suspend and resume across chunk boundaries.
const CHUNK: usize = 1024;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 || args.len() > 4 {
        eprintln!("Usage: {} <arith|keyval> <input.txt|-> [--trace]", args[0]);
        std::process::exit(1);
    }

    let grammar: Arc<Grammar> = match args[1].as_str() {
        "arith" => ARITH.clone(),
        "keyval" => KEYVAL.clone(),
        other => {
            eprintln!("Unknown grammar {:?}; expected arith or keyval", other);
            std::process::exit(1);
        }
    };
    let text = read_input(&args[2]);

    // set to 2 for step-by-step tracing on stderr
    let stderr_log_level = if args.get(3).map(String::as_str) == Some("--trace") {
        2
    } else {
        0
    };

    let engine = Engine::new(grammar).expect("grammar has no entry transition");
    let mut engine = TraceEngine::new(engine, Logger::new(0, stderr_log_level));
    engine.on_result(|v| {
        println!("RESULT {}", serde_json::to_string(v).unwrap());
    });

    // editors append a trailing newline; the arith grammar has no use for it
    let mut rest = text.strip_suffix('\n').unwrap_or(text.as_str());
    while !rest.is_empty() {
        let mut end = rest.len().min(CHUNK);
        while !rest.is_char_boundary(end) {
            end += 1;
        }
        if let Err(e) = engine.extend(&rest[..end]) {
            eprintln!("parse error: {e:#}");
            std::process::exit(1);
        }
        rest = &rest[end..];
    }

    match engine.finish() {
        Ok(Some(v)) => println!("FINAL {}", serde_json::to_string(&v).unwrap()),
        Ok(None) => println!("FINAL null"),
        Err(e) => {
            eprintln!("parse error: {e:#}");
            std::process::exit(1);
        }
    }
    eprintln!("stats: {}", serde_json::to_string(engine.stats()).unwrap());
}

fn read_input(filename: &str) -> String {
    let mut content = String::new();
    if filename == "-" {
        stdin()
            .read_to_string(&mut content)
            .expect("Unable to read stdin");
    } else {
        let mut file = File::open(filename).expect("Unable to open file");
        file.read_to_string(&mut content)
            .expect("Unable to read file");
    }
    content
}
