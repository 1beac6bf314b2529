//! Command line interface.

use std::path::PathBuf;

use clap::Parser;

/// Collect Mi Flora plant sensor readings and write them to InfluxDB.
#[derive(Debug, Parser)]
#[command(name = "flora2influx", version, about)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "FLORA_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    pub dump: bool,

    /// Log JSON to rolling files in addition to stdout
    #[arg(long, env = "FLORA_PRODUCTION")]
    pub production: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_config_path() {
        let cli = Cli::parse_from(["flora2influx", "-c", "/tmp/flora.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/flora.toml")));
        assert!(!cli.dump);
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::parse_from(["flora2influx", "--dump", "--production"]);
        assert!(cli.dump);
        assert!(cli.production);
    }
}
