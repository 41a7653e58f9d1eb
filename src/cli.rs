use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::config::DEFAULT_TEMPLATE;

#[derive(Parser, Debug)]
#[command(
    name = "tollgate",
    version,
    about = "Anthropic API proxy with real-time cost tracking",
    long_about = "Tollgate is a local proxy that sits between your coding tool (Cursor,\n\
                  Windsurf, ...) and the Anthropic API. It transparently forwards every\n\
                  request while tracking token usage and cost in a terminal dashboard.\n\n\
                  Point your tool at http://localhost:8080 instead of api.anthropic.com\n\
                  and watch your spend in real time.",
    after_help = "Examples:\n  \
        tollgate                              Run proxy + TUI dashboard\n  \
        tollgate --port 9090                  Use a custom port\n  \
        tollgate --headless                   Run proxy only (no TUI, logs to stderr)\n  \
        tollgate -c ~/.config/tollgate/my.toml  Use a specific config file\n  \
        TOLLGATE_PORT=9090 tollgate           Configure via environment"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Config file path
    #[arg(short = 'c', long, global = true, env = "TOLLGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Proxy listen port
    #[arg(short = 'p', long, env = "TOLLGATE_PORT")]
    pub port: Option<u16>,

    /// Upstream API base URL
    #[arg(short = 't', long, env = "TOLLGATE_TARGET")]
    pub target: Option<String>,

    /// Run proxy without TUI (daemon / CI mode)
    #[arg(long)]
    pub headless: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Generate a default tollgate.toml config file
    Init {
        /// Output file path
        #[arg(short = 'o', long, default_value = "tollgate.toml")]
        output: PathBuf,
        /// Overwrite if the file already exists
        #[arg(short = 'f', long)]
        force: bool,
    },
}

/// Write the embedded default config, refusing to clobber without --force.
pub fn run_init(output: &PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }

    if let Some(dir) = output.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
        }
    }

    fs::write(output, DEFAULT_TEMPLATE)
        .with_context(|| format!("writing config {}", output.display()))?;
    println!("Wrote {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::try_parse_from(["tollgate", "-p", "9090", "--headless"]).unwrap();
        assert_eq!(cli.port, Some(9090));
        assert!(cli.headless);
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["tollgate", "init", "-o", "/tmp/x.toml", "--force"]).unwrap();
        match cli.command {
            Some(Command::Init { output, force }) => {
                assert_eq!(output, PathBuf::from("/tmp/x.toml"));
                assert!(force);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
