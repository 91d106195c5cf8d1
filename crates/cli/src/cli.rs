use std::path::PathBuf;

use clap::{Parser, Subcommand};

use tierflow_core::{JobId, ServiceTier, UserId};

/// Job lifecycle pipeline: dispatch, completion, archival and restore.
#[derive(Parser, Debug)]
#[command(name = "tierflow", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the job and profile tables if they do not exist.
    Migrate,

    /// Consume job requests, claim them and launch compute.
    Dispatcher,

    /// Consume archive evaluations and demote free-tier results.
    Archive,

    /// Consume restore requests and start archival restores.
    Restore,

    /// Poll pending restores and promote finished ones back to hot storage.
    Thaw,

    /// Run all four pollers in one process.
    All,

    /// Run the compute program for one job and report its completion.
    ///
    /// This is the process the dispatcher launches.
    Complete {
        input_path: PathBuf,
        user_id: UserId,
        user_email: String,
        job_id: JobId,
    },

    /// Upload a local input file and submit it as a new job.
    Submit {
        #[arg(long)]
        user_id: UserId,
        #[arg(long)]
        email: String,
        #[arg(long)]
        file: PathBuf,
        /// Defaults to a freshly generated id.
        #[arg(long)]
        job_id: Option<JobId>,
    },

    /// Create or change a user's service tier without triggering restores.
    SetTier {
        #[arg(long)]
        user_id: UserId,
        #[arg(long)]
        tier: ServiceTier,
    },

    /// Upgrade a user to premium and restore their archived results.
    Upgrade {
        #[arg(long)]
        user_id: UserId,
    },

    /// Show one job as its owner sees it.
    Status {
        #[arg(long)]
        user_id: UserId,
        #[arg(long)]
        job_id: JobId,
    },

    /// List every job a user has submitted.
    Jobs {
        #[arg(long)]
        user_id: UserId,
    },

    /// Print the run log of a completed job.
    Log {
        #[arg(long)]
        user_id: UserId,
        #[arg(long)]
        job_id: JobId,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn complete_takes_launcher_argument_order() {
        let cli = Cli::try_parse_from([
            "tierflow",
            "complete",
            "/work/J1/J1.vcf",
            "U1",
            "u1@example.com",
            "J1",
        ])
        .unwrap();
        match cli.command {
            Command::Complete {
                input_path,
                user_id,
                user_email,
                job_id,
            } => {
                assert_eq!(input_path, PathBuf::from("/work/J1/J1.vcf"));
                assert_eq!(user_id.as_str(), "U1");
                assert_eq!(user_email, "u1@example.com");
                assert_eq!(job_id.as_str(), "J1");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn ids_and_tiers_are_validated() {
        assert!(Cli::try_parse_from(["tierflow", "upgrade", "--user-id", "a/b"]).is_err());
        assert!(
            Cli::try_parse_from(["tierflow", "set-tier", "--user-id", "U1", "--tier", "gold"])
                .is_err()
        );
        let cli =
            Cli::try_parse_from(["tierflow", "set-tier", "--user-id", "U1", "--tier", "premium"])
                .unwrap();
        assert!(matches!(
            cli.command,
            Command::SetTier {
                tier: ServiceTier::Premium,
                ..
            }
        ));
    }

    #[test]
    fn job_queries_take_owner_and_job() {
        let cli = Cli::try_parse_from(["tierflow", "jobs", "--user-id", "U1"]).unwrap();
        assert!(matches!(cli.command, Command::Jobs { ref user_id } if user_id.as_str() == "U1"));

        let cli =
            Cli::try_parse_from(["tierflow", "log", "--user-id", "U1", "--job-id", "J1"]).unwrap();
        match cli.command {
            Command::Log { user_id, job_id } => {
                assert_eq!(user_id.as_str(), "U1");
                assert_eq!(job_id.as_str(), "J1");
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["tierflow", "log", "--user-id", "U1"]).is_err());
    }
}
