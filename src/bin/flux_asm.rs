//! Light machine assembler CLI.
//!
//! Compiles a line-oriented assembly source into a program image of
//! little-endian program words, ready for `LoadProgram`.
//!
//! # Usage
//! ```text
//! flux-asm <input.lasm> [OPTIONS]
//! ```
//!
//! # Options
//! - `-o, --output <file>`: Output file path (defaults to `<input>.img`)

use fluxpilot::machine::assembler::assemble_source;
use std::env;
use std::fs;
use std::path::Path;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let input_path = &args[1];
    let mut output_path: Option<String> = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--output" | "-o") => {
                i += 1;
                if i >= args.len() {
                    eprintln!("{k} requires an argument");
                    process::exit(1);
                }
                output_path = Some(args[i].clone());
                i += 1;
            }
            other => {
                eprintln!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let source = match fs::read_to_string(input_path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not read {}: {}", input_path, e);
            process::exit(1);
        }
    };

    let output_path = output_path.unwrap_or_else(|| {
        let p = Path::new(input_path);
        let stem = p.file_stem().unwrap_or_default().to_string_lossy();
        let parent = p.parent().unwrap_or(Path::new("."));
        parent
            .join(format!("{}.img", stem))
            .to_string_lossy()
            .into_owned()
    });

    let image = match assemble_source(&source) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("Assembly failed: {}", e);
            process::exit(1);
        }
    };

    let mut bytes = Vec::with_capacity(image.len() * 2);
    for word in &image {
        bytes.extend_from_slice(&word.to_le_bytes());
    }

    if let Err(e) = fs::write(&output_path, &bytes) {
        eprintln!("Failed to write output file: {}", e);
        process::exit(1);
    }

    println!(
        "Compiled {} -> {} ({} words)",
        input_path,
        output_path,
        image.len()
    );
}

const USAGE: &str = "\
Light Machine Assembler

USAGE:
    {program} <input.lasm> [OPTIONS]

ARGS:
    <input.lasm>    Assembly source file to compile

OPTIONS:
    -o, --output <file>    Output file path (defaults to <input>.img)
    -h, --help             Print this help message
";

fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}
