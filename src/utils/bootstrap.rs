//! Bootstrap utilities for the handlerd binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the HANDLERD_LOG environment variable.
///
/// Defaults to "info" level if HANDLERD_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Extract the config file path from command-line arguments.
///
/// Accepts `--config <path>`, `--config=<path>` and `-c <path>`. The first
/// element is the program name and is skipped.
pub fn parse_config_path<I>(args: I) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_config_path() {
        assert_eq!(
            parse_config_path(args(&["handlerd", "--config", "a.yaml"])),
            Some("a.yaml".to_string())
        );
        assert_eq!(
            parse_config_path(args(&["handlerd", "--config=b.yaml"])),
            Some("b.yaml".to_string())
        );
        assert_eq!(
            parse_config_path(args(&["handlerd", "-c", "c.yaml"])),
            Some("c.yaml".to_string())
        );
    }

    #[test]
    fn test_parse_config_path_absent() {
        assert_eq!(parse_config_path(args(&["handlerd"])), None);
        assert_eq!(parse_config_path(args(&["handlerd", "--config"])), None);
        assert_eq!(parse_config_path(args(&["--config", "x.yaml"])), None);
    }
}
