mod args;
mod debug_level;

use args::{CliError, Parsed};
use dirsrv_core::{ErrorLogSink, ExecutionMode, Orchestrator, Services};
use std::process::ExitCode;
use tracing::{error, info};

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let argv: Vec<String> = std::env::args().collect();
    let program = argv.first().map_or("ns-slapd", String::as_str);
    let selection = ExecutionMode::select(&argv);
    if selection.mode == ExecutionMode::Unknown {
        eprintln!("{}", dirsrv_core::mode::general_usage(program));
        return ExitCode::from(EXIT_FAILURE);
    }

    let flags = argv.get(selection.first_flag..).unwrap_or_default();
    let (invocation, debug) = match args::parse(selection.mode, flags) {
        Ok(Parsed::Run { invocation, debug }) => (invocation, debug),
        Ok(Parsed::DebugHelp) => {
            eprint!("{}", debug_level::usage());
            return ExitCode::from(EXIT_FAILURE);
        }
        Err(CliError::Clap(e)) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_FAILURE)
            } else {
                ExitCode::from(EXIT_SUCCESS)
            };
        }
        Err(CliError::Usage { message, usage }) => {
            eprintln!("{program}: {message}");
            eprintln!("{usage}");
            return ExitCode::from(EXIT_FAILURE);
        }
        Err(CliError::Debug(message)) => {
            eprintln!("{program}: {message}");
            eprint!("{}", debug_level::usage());
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let sink = ErrorLogSink::new();
    let default_level = debug.map_or("info", debug_level::filter_directive);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DIRSRV_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(sink.clone())
        .with_ansi(false)
        .with_target(false)
        .init();
    if let Some(level) = debug {
        info!("debug level: {} ({level})", debug_level::describe(level));
    }

    let services = Services {
        log_sink: Some(sink),
        ..Services::default()
    };
    match Orchestrator::new(invocation, services).run() {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) if e.is_usage() => {
            eprintln!("{program}: {e}");
            eprintln!("{}", args::usage_for(selection.mode));
            ExitCode::from(EXIT_FAILURE)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
