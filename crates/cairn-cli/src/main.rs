use std::{env, process::ExitCode, sync::Arc, time::Instant};

use cairn::{Context, ContextConfig, DirPath};

const USAGE: &str = "\
usage: cairn [options] [variables] [buildspec]

The buildspec is a meta-operation, operation, and target set, for
example: update, clean(tests/), configure(update(./)). The default is
update(./).

options:
  --jobs|-j <num>   number of jobs to perform in parallel
  --serial          run serially (same as --jobs 1)
  --verbose <num>   diagnostics verbosity, 0-3 (default 1)
  -v                same as --verbose 2
  --quiet|-q        same as --verbose 0
  --keep-going      continue as much as possible after an error
  --dry-run         print commands without executing them
  --dump-format <f> dump meta-operation output format (text, json)
  --help|-h         print this text and exit

variables:
  name=value        override a configuration variable
  name+=value       append to a configuration variable
  name=+value       prepend to a configuration variable
  dir/@name=value   as above, confined to a scope directory
";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut config = ContextConfig::default();
    let mut buildspec = String::new();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print!("{USAGE}");
                return ExitCode::SUCCESS;
            }
            "--serial" => config.jobs = 1,
            "--jobs" | "-j" => {
                let Some(n) = args.next().and_then(|v| v.parse().ok()) else {
                    eprintln!("error: --jobs requires a number");
                    return ExitCode::from(2);
                };
                config.jobs = n;
            }
            "--verbose" => {
                let Some(n) = args.next().and_then(|v| v.parse().ok()) else {
                    eprintln!("error: --verbose requires a number");
                    return ExitCode::from(2);
                };
                config.verbosity = n;
            }
            "-v" => config.verbosity = 2,
            "--quiet" | "-q" => config.verbosity = 0,
            "--keep-going" => config.keep_going = true,
            "--dry-run" => config.dry_run = true,
            "--dump-format" => {
                let Some(f) = args.next() else {
                    eprintln!("error: --dump-format requires 'text' or 'json'");
                    return ExitCode::from(2);
                };
                match f.as_str() {
                    "json" => config.dump_json = true,
                    "text" => config.dump_json = false,
                    other => {
                        eprintln!("error: unknown dump format '{other}'");
                        return ExitCode::from(2);
                    }
                }
            }
            _ if arg.starts_with('-') => {
                eprintln!("error: unknown option '{arg}'");
                eprintln!("  info: run 'cairn --help' for usage");
                return ExitCode::from(2);
            }
            _ if arg.contains('=') && !arg.contains(['(', '{']) => {
                config.overrides.push(arg);
            }
            _ => {
                if !buildspec.is_empty() {
                    buildspec.push(' ');
                }
                buildspec.push_str(&arg);
            }
        }
    }

    let ctx: Arc<Context> = match Context::new(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    let start = Instant::now();
    let cwd = match env::current_dir() {
        Ok(d) => DirPath::new(d),
        Err(e) => {
            eprintln!("error: cannot determine current directory: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cairn::run(&ctx, &cwd, &buildspec) {
        Ok(_) => {
            if ctx.diag.at(3) {
                eprintln!("time: {:?}", start.elapsed());
            }
            if ctx.diag.error_count() > 0 { ExitCode::FAILURE } else { ExitCode::SUCCESS }
        }
        Err(e) => {
            ctx.diag.error(&e);
            ExitCode::FAILURE
        }
    }
}
