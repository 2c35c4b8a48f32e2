//! CLI argument definitions for bugledger.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BL_GIT_COMMIT"),
    " ",
    env!("BL_BUILD_TIMESTAMP"),
    ")"
);

/// Bugledger - lifecycle tracking for fuzzer-found bugs.
///
/// Crashes come in through `bl crash report`; everything else (duplicates,
/// reporting stages, bisections) hangs off the resulting bugs.
#[derive(Parser, Debug)]
#[command(name = "bl")]
#[command(author, version = VERSION, about = "Track fuzzer-found bugs from first crash to fix", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Data directory holding the ledger database.
    /// Defaults to ~/.local/share/bugledger.
    #[arg(long, global = true, env = "BL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Path to config.kdl. Defaults to <data dir>/config.kdl.
    #[arg(long, global = true, env = "BL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Diagnostic log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Emit diagnostic logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the data directory, database and a default config.kdl
    Init,

    /// Crash intake
    Crash {
        #[command(subcommand)]
        command: CrashCommands,
    },

    /// Bug inspection and status changes
    Bug {
        #[command(subcommand)]
        command: BugCommands,
    },

    /// Staged external reporting
    Report {
        #[command(subcommand)]
        command: ReportCommands,
    },

    /// Patch tests and bisections
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Fuzzing manager status
    Manager {
        #[command(subcommand)]
        command: ManagerCommands,
    },

    /// External discussion threads
    Discussion {
        #[command(subcommand)]
        command: DiscussionCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum CrashCommands {
    /// Record a crash observed by a fuzzing manager
    Report {
        /// Namespace the manager fuzzes
        #[arg(long = "ns")]
        namespace: String,

        /// Manager name
        #[arg(long)]
        manager: String,

        /// Crash title
        #[arg(long)]
        title: String,

        /// Alternative titles of the same crash
        #[arg(long = "alt-title")]
        alt_titles: Vec<String>,

        /// Build the crash happened on
        #[arg(long)]
        build_id: Option<String>,

        /// Console log file
        #[arg(long)]
        log: Option<PathBuf>,

        /// Symbolized report file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Fuzzer-format reproducer file
        #[arg(long)]
        repro_syz: Option<PathBuf>,

        /// C reproducer file
        #[arg(long)]
        repro_c: Option<PathBuf>,

        /// Options the reproducer needs
        #[arg(long)]
        repro_opts: Option<String>,

        /// Machine description file
        #[arg(long)]
        machine_info: Option<PathBuf>,

        /// Source files blamed by the report
        #[arg(long = "guilty-file")]
        guilty_files: Vec<String>,

        /// Maintainers to notify
        #[arg(long = "maintainer")]
        maintainers: Vec<String>,

        /// Lower numbers are reported first
        #[arg(long, default_value = "0")]
        priority: i64,
    },

    /// List saved crashes of a bug
    List {
        /// Bug key
        bug: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CloseStatus {
    Fixed,
    Invalid,
}

#[derive(Subcommand, Debug)]
pub enum BugCommands {
    /// Show a bug
    Show {
        /// Bug key or short stage ID
        bug: String,

        /// Follow duplicate links to the canonical bug
        #[arg(long)]
        canonical: bool,
    },

    /// Find a bug by its display title, e.g. "WARNING in foo (2)"
    Title {
        #[arg(long = "ns")]
        namespace: String,

        title: String,
    },

    /// Find a bug by a reporting stage ID (short or legacy full-length)
    Stage {
        id: String,
    },

    /// Mark a bug as a duplicate of another
    Dup {
        /// Bug key
        bug: String,

        /// Bug it duplicates
        dup_of: String,
    },

    /// Close a bug as fixed or invalid
    Status {
        /// Bug key
        bug: String,

        #[arg(value_enum)]
        status: CloseStatus,

        /// Why the bug was closed
        #[arg(long)]
        reason: Option<String>,
    },

    /// Reopen a closed bug
    Reopen {
        /// Bug key
        bug: String,
    },

    /// List bugs sharing an alternate title with this one
    Similar {
        /// Bug key
        bug: String,
    },

    /// Record the commits that fix a bug
    Commits {
        /// Bug key
        bug: String,

        /// Commit titles
        #[arg(required = true)]
        commits: Vec<String>,
    },

    /// Set a label by hand
    Label {
        /// Bug key
        bug: String,

        /// Label kind, e.g. "subsystems" or "prio"
        label: String,

        value: String,

        /// Who sets the label
        #[arg(long)]
        by: String,

        /// Link to the discussion that set it
        #[arg(long)]
        link: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ReportCommands {
    /// Report a bug to its current stage
    Send {
        /// Bug key
        bug: String,

        /// Crash to report; the best saved crash if omitted
        #[arg(long)]
        crash: Option<i64>,

        /// Directory the outbox files are written to.
        /// Defaults to <data dir>/outbox.
        #[arg(long)]
        outbox: Option<PathBuf>,
    },

    /// Stop reporting the current stage until released
    Hold {
        /// Bug key
        bug: String,
    },

    /// Release a held stage
    Release {
        /// Bug key
        bug: String,
    },

    /// Close the current stage so the next one takes over
    Upstream {
        /// Bug key
        bug: String,
    },

    /// Record a label communicated to a stage's external system
    Label {
        /// Bug key
        bug: String,

        stage: String,

        label: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Create a patch test or bisection
    Create {
        /// Bug key
        bug: String,

        /// test_patch, bisect_cause or bisect_fix
        #[arg(long)]
        kind: String,

        /// Requester
        #[arg(long)]
        user: String,

        #[arg(long)]
        repo: String,

        #[arg(long)]
        branch: String,

        /// Crash to test; the best saved crash if omitted
        #[arg(long)]
        crash: Option<i64>,

        #[arg(long)]
        merge_base_repo: Option<String>,

        #[arg(long)]
        merge_base_branch: Option<String>,

        /// Revision to start bisection from
        #[arg(long)]
        bisect_from: Option<String>,

        /// Patch file
        #[arg(long)]
        patch: Option<PathBuf>,

        /// Kernel config file
        #[arg(long)]
        kernel_config: Option<PathBuf>,

        /// Patch-less run to find the tree the bug originates from
        #[arg(long)]
        tree_origin: bool,
    },

    /// Mark a job as started
    Start {
        /// Job key ("<bug>/<id>")
        job: String,
    },

    /// Record a job's result
    Finish {
        /// Job key ("<bug>/<id>")
        job: String,

        /// Title of the crash hit during testing
        #[arg(long)]
        crash_title: Option<String>,

        /// Commit found by bisection (repeat for several)
        #[arg(long = "commit")]
        commits: Vec<String>,

        /// Result quality flags bitmask
        #[arg(long, default_value = "0")]
        flags: u32,

        /// Job log file
        #[arg(long)]
        log: Option<PathBuf>,

        /// Error output file; marks the job failed
        #[arg(long)]
        error: Option<PathBuf>,
    },

    /// Note that a job's result was reported back
    Reported {
        /// Job key ("<bug>/<id>")
        job: String,
    },

    /// Mark a finished bisection as wrong
    Invalidate {
        /// Job key ("<bug>/<id>")
        job: String,

        #[arg(long)]
        user: String,
    },

    /// List jobs of a bug
    List {
        /// Bug key
        bug: String,
    },

    /// Hand queued and stale jobs to the runner spool
    Dispatch {
        /// Spool directory. Defaults to <data dir>/jobs.
        #[arg(long)]
        spool: Option<PathBuf>,

        /// Running jobs older than this are restarted
        #[arg(long, default_value = "6")]
        stale_hours: i64,
    },

    /// List running jobs whose runner appears dead
    Stale {
        #[arg(long, default_value = "6")]
        hours: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum ManagerCommands {
    /// Record a manager heartbeat
    Heartbeat {
        #[arg(long = "ns")]
        namespace: String,

        /// Manager name
        name: String,

        #[arg(long)]
        link: Option<String>,

        #[arg(long)]
        build: Option<String>,

        #[arg(long, default_value = "0")]
        up_time: u64,

        /// Seconds fuzzed since the last heartbeat
        #[arg(long, default_value = "0")]
        fuzzing_time: u64,

        #[arg(long, default_value = "0")]
        corpus: i64,

        #[arg(long, default_value = "0")]
        pcs: i64,

        #[arg(long, default_value = "0")]
        cover: i64,

        /// Crashes since the last heartbeat
        #[arg(long, default_value = "0")]
        crashes: i64,

        #[arg(long, default_value = "0")]
        crash_types: i64,

        #[arg(long, default_value = "0")]
        suppressed_crashes: i64,

        /// Executions since the last heartbeat
        #[arg(long, default_value = "0")]
        execs: i64,
    },

    /// Show a manager and its daily stats
    Show {
        #[arg(long = "ns")]
        namespace: String,

        name: String,
    },

    /// List the managers of a namespace
    List {
        #[arg(long = "ns")]
        namespace: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum DiscussionCommands {
    /// Merge a thread update
    Record {
        /// Source of the thread, e.g. a mailing list archive
        #[arg(long)]
        source: String,

        /// Base message ID of the thread
        #[arg(long)]
        id: String,

        #[arg(long, default_value = "")]
        kind: String,

        #[arg(long, default_value = "")]
        subject: String,

        /// Bug keys the thread mentions
        #[arg(long = "bug")]
        bugs: Vec<String>,

        /// JSON file with an array of {id, external, patch, time} messages
        #[arg(long)]
        messages: Option<PathBuf>,
    },
}
