use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "samrobotd")]
#[command(about = "Robotic media mount, label, clean and audit daemon for tape and optical libraries")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write log records as JSON
    #[arg(long, global = true)]
    pub json_log: bool,

    /// Specify configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LabelKind {
    /// ANSI VOL1/HDR1/HDR2
    Tape,
    /// Primary volume and partition descriptors
    Optical,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the library against the simulated robot and play a request script
    Run {
        /// JSON request script
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,

        /// Seconds to wait for all requests to finish
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Build a label image for a VSN
    Mklabel {
        /// Volume serial name
        #[arg(value_name = "VSN")]
        vsn: String,

        /// Output image file
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        #[arg(short, long, value_enum, default_value = "tape")]
        kind: LabelKind,

        /// Tape block size in bytes, 0 for the drive default
        #[arg(short, long, default_value = "0")]
        block_size: u32,

        /// Extra volume information
        #[arg(short, long)]
        info: Option<String>,

        /// Sector count recorded in the optical partition descriptor
        #[arg(long, default_value = "1048576")]
        sectors: u32,
    },

    /// Decode a label image
    Showlabel {
        /// Label image file
        #[arg(value_name = "IMAGE")]
        image: PathBuf,

        #[arg(short, long, value_enum, default_value = "tape")]
        kind: LabelKind,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config {
        /// Write the configuration to the default location
        #[arg(long)]
        save: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mklabel() {
        let cli = Cli::try_parse_from([
            "samrobotd", "mklabel", "TEST01", "out.img", "--block-size", "32768",
        ])
        .unwrap();
        match cli.command {
            Commands::Mklabel {
                vsn,
                block_size,
                kind,
                ..
            } => {
                assert_eq!(vsn, "TEST01");
                assert_eq!(block_size, 32768);
                assert_eq!(kind, LabelKind::Tape);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "samrobotd", "showlabel", "a.img", "-k", "optical", "--json", "-v", "--config", "c.json",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(!cli.json_log);
        assert_eq!(cli.config, Some(PathBuf::from("c.json")));
        assert!(matches!(
            cli.command,
            Commands::Showlabel {
                kind: LabelKind::Optical,
                json: true,
                ..
            }
        ));
    }

    #[test]
    fn test_run_requires_script() {
        assert!(Cli::try_parse_from(["samrobotd", "run"]).is_err());
    }
}
