use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pvelink",
    about = "Generate idempotent Proxmox VE UDP tunnel NIC arguments",
    version
)]
pub struct Cli {
    /// Log allocation decisions to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Plan all links and print the `qm set` commands
    Plan {
        /// Mapping file (YAML, or JSON with a .json extension)
        mapping: PathBuf,
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Shell)]
        format: Format,
        /// Ignore host state and plan as if every VM were new
        #[arg(long)]
        fresh: bool,
        /// Directory holding <vmid>.conf files
        #[arg(long)]
        conf_dir: Option<String>,
        /// qm binary used for `showcmd`
        #[arg(long)]
        qm: Option<String>,
    },
    /// Validate a mapping file without reading host state
    Check {
        /// Mapping file
        mapping: PathBuf,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Set a configuration value
    Set {
        /// Config key (conf_dir, qm_bin)
        key: String,
        /// Config value
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Summary comments plus one `qm set` per VM
    Shell,
    /// Full plan as JSON
    Json,
    /// One row per interface
    Table,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_defaults() {
        let cli = Cli::parse_from(["pvelink", "plan", "links.yaml"]);
        assert!(!cli.verbose);
        match cli.command {
            Command::Plan {
                mapping,
                format,
                fresh,
                conf_dir,
                qm,
            } => {
                assert_eq!(mapping, PathBuf::from("links.yaml"));
                assert_eq!(format, Format::Shell);
                assert!(!fresh);
                assert!(conf_dir.is_none() && qm.is_none());
            }
            _ => panic!("expected plan"),
        }
    }

    #[test]
    fn plan_flags() {
        let cli = Cli::parse_from([
            "pvelink", "-v", "plan", "l.yaml", "--format", "json", "--fresh", "--qm", "/bin/qm",
        ]);
        assert!(cli.verbose);
        let Command::Plan {
            format, fresh, qm, ..
        } = cli.command
        else {
            panic!("expected plan");
        };
        assert_eq!(format, Format::Json);
        assert!(fresh);
        assert_eq!(qm.as_deref(), Some("/bin/qm"));
    }

    #[test]
    fn rejects_unknown_format() {
        assert!(Cli::try_parse_from(["pvelink", "plan", "l.yaml", "--format", "xml"]).is_err());
    }
}
