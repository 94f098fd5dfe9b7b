use std::path::PathBuf;

use clap::{Parser, Subcommand};
use warden_core::tuple::{EntityRef, Subject};

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Evaluate permissions against a fixture")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Decide whether a subject holds a permission on an entity.
    Check {
        #[arg(long)]
        fixture: PathBuf,
        #[arg(long)]
        entity: EntityRef,
        #[arg(long)]
        permission: String,
        #[arg(long)]
        subject: Subject,
        #[arg(long)]
        depth: Option<u32>,
    },
    /// Print the resolution tree of a permission as JSON.
    Expand {
        #[arg(long)]
        fixture: PathBuf,
        #[arg(long)]
        entity: EntityRef,
        #[arg(long)]
        permission: String,
        #[arg(long)]
        depth: Option<u32>,
    },
    /// List the permissions implied by a set of relations.
    LookupSchema {
        #[arg(long)]
        fixture: PathBuf,
        #[arg(long)]
        entity_type: String,
        #[arg(long = "relation")]
        relations: Vec<String>,
    },
    /// Run the fixture's assertions.
    Validate {
        #[arg(long)]
        fixture: PathBuf,
    },
}

impl Command {
    pub fn fixture(&self) -> &PathBuf {
        match self {
            Self::Check { fixture, .. }
            | Self::Expand { fixture, .. }
            | Self::LookupSchema { fixture, .. }
            | Self::Validate { fixture } => fixture,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_parses_check() {
        let cli = Cli::parse_from([
            "warden",
            "check",
            "--fixture",
            "drive.toml",
            "--entity",
            "doc:1",
            "--permission",
            "read",
            "--subject",
            "user:alice",
            "--depth",
            "5",
        ]);

        match cli.command {
            Command::Check {
                entity,
                permission,
                subject,
                depth,
                ..
            } => {
                assert_eq!(entity, EntityRef::new("doc", "1"));
                assert_eq!(permission, "read");
                assert_eq!(subject, Subject::concrete("user", "alice"));
                assert_eq!(depth, Some(5));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_userset_subject() {
        let cli = Cli::parse_from([
            "warden",
            "check",
            "--fixture",
            "f.toml",
            "--entity",
            "doc:1",
            "--permission",
            "read",
            "--subject",
            "group:eng#member",
        ]);

        assert!(matches!(
            cli.command,
            Command::Check { subject, .. } if subject.is_userset()
        ));
    }

    #[test]
    fn cli_rejects_malformed_entity() {
        let result = Cli::try_parse_from([
            "warden",
            "expand",
            "--fixture",
            "f.toml",
            "--entity",
            "doc",
            "--permission",
            "read",
        ]);

        assert!(result.is_err());
    }

    #[test]
    fn cli_collects_repeated_relations() {
        let cli = Cli::parse_from([
            "warden",
            "lookup-schema",
            "--fixture",
            "github.toml",
            "--entity-type",
            "organization",
            "--relation",
            "admin",
            "--relation",
            "member",
        ]);

        assert!(matches!(
            cli.command,
            Command::LookupSchema { ref relations, .. } if relations == &["admin", "member"]
        ));
        assert_eq!(cli.command.fixture(), &PathBuf::from("github.toml"));
    }

    #[test]
    fn cli_config_flag_works_after_subcommand() {
        let cli = Cli::parse_from([
            "warden",
            "validate",
            "--fixture",
            "f.toml",
            "--config",
            "/etc/warden.toml",
        ]);

        assert_eq!(cli.config, Some(PathBuf::from("/etc/warden.toml")));
        assert!(matches!(cli.command, Command::Validate { .. }));
    }

    #[test]
    fn cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["warden"]).is_err());
    }

    #[test]
    fn cli_version_flag() {
        let err = Cli::try_parse_from(["warden", "--version"]).unwrap_err();

        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
