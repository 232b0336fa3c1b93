//! polyrun - host diagnostics for foreign-architecture servers
//!
//! Reports what the library would decide on this host without starting
//! anything.
//!
//! ## Usage
//!
//! ```sh
//! polyrun probe                        # union-mount capabilities (JSON)
//! polyrun inspect <file>               # header-derived OS/arch (JSON)
//! polyrun handlers [--binfmt-dir D]    # handlers in precedence order
//! polyrun resolve <file> [--binfmt-dir D]
//! polyrun materialize <dest> <layer>...
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `polyrun=warn`).

use polyrun::storage::SoftwareOverlay;
use polyrun::{CapabilityState, EmulatorRegistry, FormatResolver, RegistryConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Probe,
    Inspect {
        path: PathBuf,
    },
    Handlers {
        binfmt_dir: Option<PathBuf>,
    },
    Resolve {
        path: PathBuf,
        binfmt_dir: Option<PathBuf>,
    },
    Materialize {
        dest: PathBuf,
        layers: Vec<PathBuf>,
    },
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "probe" => Ok(Command::Probe),
        "inspect" => {
            let path = args.get(2).ok_or("inspect requires <file>")?;
            Ok(Command::Inspect {
                path: PathBuf::from(path),
            })
        }
        "handlers" => Ok(Command::Handlers {
            binfmt_dir: binfmt_dir_flag(&args[2..])?,
        }),
        "resolve" => {
            let path = args.get(2).ok_or("resolve requires <file>")?;
            Ok(Command::Resolve {
                path: PathBuf::from(path),
                binfmt_dir: binfmt_dir_flag(&args[3..])?,
            })
        }
        "materialize" => {
            if args.len() < 4 {
                return Err("materialize requires <dest> and at least one <layer>".to_string());
            }
            Ok(Command::Materialize {
                dest: PathBuf::from(&args[2]),
                layers: args[3..].iter().map(PathBuf::from).collect(),
            })
        }
        "version" | "--version" | "-V" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("unknown command: {}", other)),
    }
}

fn binfmt_dir_flag(rest: &[String]) -> Result<Option<PathBuf>, String> {
    let mut binfmt_dir = None;
    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--binfmt-dir" => {
                let dir = rest.get(i + 1).ok_or("--binfmt-dir requires a path")?;
                binfmt_dir = Some(PathBuf::from(dir));
                i += 2;
            }
            other => return Err(format!("unexpected argument: {}", other)),
        }
    }
    Ok(binfmt_dir)
}

fn registry_config(binfmt_dir: Option<PathBuf>) -> RegistryConfig {
    match binfmt_dir {
        Some(dir) => RegistryConfig::default().with_binfmt_dir(dir),
        None => RegistryConfig::default(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

// =============================================================================
// Commands
// =============================================================================

fn cmd_probe() -> Result<(), String> {
    print_json(&CapabilityState::probe())
}

fn cmd_inspect(path: PathBuf) -> Result<(), String> {
    let profile = polyrun::inspect(&path).map_err(|e| e.to_string())?;
    print_json(&profile)
}

fn cmd_handlers(binfmt_dir: Option<PathBuf>) -> Result<(), String> {
    let registry = EmulatorRegistry::with_config(registry_config(binfmt_dir));
    let handlers = registry.discover().map_err(|e| e.to_string())?;

    println!("{:<4} {:<10} {:<10} {:<11} INTERPRETER", "#", "OS", "ARCH", "SOURCE");
    for (index, handler) in handlers.iter().enumerate() {
        let interpreter = handler
            .interpreter()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        let dispatch = if handler.auto_dispatch() { " (auto)" } else { "" };
        println!(
            "{:<4} {:<10} {:<10} {:<11} {}{}",
            index + 1,
            handler.os,
            handler.arch,
            handler.source.label(),
            interpreter,
            dispatch
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct Resolution {
    profile: polyrun::ExecutableProfile,
    handler: polyrun::FormatHandler,
    requires_emulation: bool,
}

fn cmd_resolve(path: PathBuf, binfmt_dir: Option<PathBuf>) -> Result<(), String> {
    let resolver =
        FormatResolver::discover(registry_config(binfmt_dir)).map_err(|e| e.to_string())?;
    let profile = polyrun::inspect(&path).map_err(|e| e.to_string())?;
    let handler = resolver.resolve(&path).map_err(|e| e.to_string())?;
    print_json(&Resolution {
        profile,
        requires_emulation: handler.requires_wrapping(),
        handler,
    })
}

fn cmd_materialize(dest: PathBuf, layers: Vec<PathBuf>) -> Result<(), String> {
    let stats = SoftwareOverlay::new(layers)
        .materialize(&dest)
        .map_err(|e| e.to_string())?;
    println!(
        "{} files, {} directories, {} symlinks, {} bytes",
        stats.files, stats.dirs, stats.symlinks, stats.bytes
    );
    Ok(())
}

fn cmd_version() {
    println!("polyrun version {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"polyrun - run platform-specific servers on foreign hosts

USAGE:
    polyrun <command> [options]

COMMANDS:
    probe                          Report union-mount capabilities (JSON)
    inspect <file>                 Show an executable's OS and architecture (JSON)
    handlers                       List format handlers in precedence order
    resolve <file>                 Show the handler chosen for an executable (JSON)
    materialize <dest> <layer>...  Copy a first-wins merge of layers into dest
    version                        Show version info
    help                           Show this help

OPTIONS:
    --binfmt-dir <path>    Format-registration directory (default: /proc/sys/fs/binfmt_misc)

ENVIRONMENT:
    RUST_LOG               Log filter (default: polyrun=warn)
"#
    );
}

// =============================================================================
// Main
// =============================================================================

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("polyrun=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_logging();

    match parse_args() {
        Ok(cmd) => {
            let result = match cmd {
                Command::Probe => cmd_probe(),
                Command::Inspect { path } => cmd_inspect(path),
                Command::Handlers { binfmt_dir } => cmd_handlers(binfmt_dir),
                Command::Resolve { path, binfmt_dir } => cmd_resolve(path, binfmt_dir),
                Command::Materialize { dest, layers } => cmd_materialize(dest, layers),
                Command::Version => {
                    cmd_version();
                    Ok(())
                }
                Command::Help => {
                    cmd_help();
                    Ok(())
                }
            };

            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            ExitCode::FAILURE
        }
    }
}
