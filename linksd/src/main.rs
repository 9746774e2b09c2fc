//! # Links Host Daemon
//!
//! Main entry point: boots the pipe service and runs an echo session.

use linksd::{init_tracing, HostConfig, HostRuntime};
use std::env;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();

    let config = parse_args(&args).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        print_usage(program_name(&args));
        process::exit(1);
    });

    if let Err(e) = init_tracing(&config.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let runtime = HostRuntime::new(config).unwrap_or_else(|e| {
        eprintln!("Failed to create runtime: {}", e);
        process::exit(1);
    });

    match runtime.run() {
        Ok(report) => {
            println!("connected at version {}", report.negotiated_version);
            for reply in &report.replies {
                println!("{}", reply);
            }
        }
        Err(e) => {
            eprintln!("Runtime error: {}", e);
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<HostConfig, String> {
    let mut config = HostConfig::default();
    let mut messages = Vec::new();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--log-level" | "-l" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing value for --log-level".to_string());
                }
                config.log_level = args[i].clone();
            }
            "--name" | "-n" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing value for --name".to_string());
                }
                config.server_name = args[i].clone();
            }
            "--version" | "-v" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing value for --version".to_string());
                }
                config.server_version = args[i].clone();
            }
            "--help" | "-h" => {
                print_usage(program_name(args));
                process::exit(0);
            }
            other if other.starts_with('-') => {
                return Err(format!("Unknown option: {}", other));
            }
            message => messages.push(message.to_string()),
        }
        i += 1;
    }

    if !messages.is_empty() {
        config.messages = messages;
    }
    Ok(config)
}

fn program_name(args: &[String]) -> &str {
    args.first().map(String::as_str).unwrap_or("linksd")
}

fn print_usage(program: &str) {
    eprintln!("Usage: {} [OPTIONS] [MESSAGE...]", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -l, --log-level <FILTER>  Log filter when RUST_LOG is unset (default: info)");
    eprintln!("  -n, --name <NAME>         Pipe server name (default: echo)");
    eprintln!("  -v, --version <VERSION>   Server version, major.minor[.micro] (default: 1.0.0)");
    eprintln!("  -h, --help                Show this help message");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  {} hello world", program);
    eprintln!("  {} --name calc --version 2.1 --log-level debug ping", program);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("linksd")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_defaults() {
        assert_eq!(parse_args(&args(&[])).unwrap(), HostConfig::default());
    }

    #[test]
    fn test_parse_options_and_messages() {
        let config =
            parse_args(&args(&["-n", "calc", "--version", "2.1", "a", "b"])).unwrap();
        assert_eq!(config.server_name, "calc");
        assert_eq!(config.server_version, "2.1");
        assert_eq!(config.messages, vec!["a", "b"]);
    }

    #[test]
    fn test_empty_argv() {
        assert_eq!(program_name(&[]), "linksd");
        assert_eq!(program_name(&args(&[])), "linksd");
        assert_eq!(parse_args(&[]).unwrap(), HostConfig::default());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args(&["--name"])).is_err());
        assert!(parse_args(&args(&["--bogus"])).is_err());
    }
}
