use std::sync::Arc;

use anyhow::Context;
use spsync::config::SyncConfig;
use spsync::publish::Publisher;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Push { diff: bool },
    Pull,
    Watch,
    Actions,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = None;
    let mut diff = false;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "push" => mode = Some(CliMode::Push { diff: false }),
            "pull" => mode = Some(CliMode::Pull),
            "watch" => mode = Some(CliMode::Watch),
            "actions" => mode = Some(CliMode::Actions),
            "--diff" => diff = true,
            "--help" | "-h" => return Ok(CliMode::Help),
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    match mode {
        Some(CliMode::Push { .. }) => Ok(CliMode::Push { diff }),
        Some(_) if diff => anyhow::bail!("--diff is only valid with push"),
        Some(mode) => Ok(mode),
        None => Ok(CliMode::Help),
    }
}

fn print_usage() {
    println!("Usage: spsync <push [--diff] | pull | watch | actions>");
    println!("  push       Upload the dist folder");
    println!("  --diff     Skip files whose remote size matches");
    println!("  pull       Download the remote folder into the dist folder");
    println!("  watch      Upload changes until Ctrl-C");
    println!("  actions    Print custom actions with resolved script URLs");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_usage();
        return Ok(());
    }

    let config = SyncConfig::from_env()?;
    if mode == CliMode::Pull {
        std::fs::create_dir_all(&config.dist_folder).with_context(|| {
            format!("failed to create {}", config.dist_folder.display())
        })?;
    }
    let publisher = Publisher::connect(&config).await?;
    match mode {
        CliMode::Push { diff } => {
            let report = publisher.push(diff).await?;
            if !report.is_success() {
                for failure in &report.failed {
                    eprintln!("failed: {} ({})", failure.relative_path, failure.error);
                }
                anyhow::bail!("{} file(s) failed to upload", report.failed.len());
            }
        }
        CliMode::Pull => {
            let report = publisher.pull().await?;
            if !report.is_success() {
                for failure in &report.failed {
                    eprintln!("failed: {} ({})", failure.relative_path, failure.error);
                }
                anyhow::bail!("{} file(s) failed to download", report.failed.len());
            }
        }
        CliMode::Watch => {
            publisher
                .watch(Arc::new(|path| info!(path = %path.display(), "changed")))
                .await?;
        }
        CliMode::Actions => {
            let actions = publisher
                .resolve_custom_actions(&config.custom_actions)
                .await;
            println!("{}", serde_json::to_string_pretty(&actions)?);
        }
        CliMode::Help => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("spsync")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_help() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_supports_push_with_diff() {
        assert_eq!(
            parse_cli_mode(args(&["push"])).unwrap(),
            CliMode::Push { diff: false }
        );
        assert_eq!(
            parse_cli_mode(args(&["push", "--diff"])).unwrap(),
            CliMode::Push { diff: true }
        );
    }

    #[test]
    fn parse_cli_mode_supports_pull_watch_and_actions() {
        assert_eq!(parse_cli_mode(args(&["pull"])).unwrap(), CliMode::Pull);
        assert_eq!(parse_cli_mode(args(&["watch"])).unwrap(), CliMode::Watch);
        assert_eq!(parse_cli_mode(args(&["actions"])).unwrap(), CliMode::Actions);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_and_misplaced_flags() {
        assert!(parse_cli_mode(args(&["--force"])).is_err());
        assert!(parse_cli_mode(args(&["watch", "--diff"])).is_err());
        assert!(parse_cli_mode(args(&["pull", "--diff"])).is_err());
    }
}
