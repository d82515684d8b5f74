use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "loam")]
#[command(about = "Notes, folders and resources synced to any file store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile name holding the sync target
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,

    /// Sync target URI, overriding the profile (e.g. file:///mnt/notes, s3://bucket/prefix)
    #[arg(long, global = true, value_name = "URI")]
    pub target: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new note
    #[command(alias = "new")]
    Add {
        /// Note title
        title: String,
        /// Note body (read from stdin when omitted and piped)
        body: Vec<String>,
        /// Parent folder ID or unique ID prefix
        #[arg(long, value_name = "ID")]
        parent: Option<String>,
    },
    /// Create a folder
    Mkdir {
        /// Folder title
        title: String,
        /// Parent folder ID or unique ID prefix
        #[arg(long, value_name = "ID")]
        parent: Option<String>,
    },
    /// Store a file as a resource
    Attach {
        /// File to store
        path: PathBuf,
        /// Resource title (file name when omitted)
        #[arg(long)]
        title: Option<String>,
        /// Parent folder ID or unique ID prefix
        #[arg(long, value_name = "ID")]
        parent: Option<String>,
    },
    /// List recently updated items
    List {
        /// Number of items to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit an existing item; opens $EDITOR on the body without flags
    Edit {
        /// Item ID or unique ID prefix
        id: String,
        /// New title
        #[arg(long)]
        title: Option<String>,
        /// New body
        #[arg(long)]
        body: Option<String>,
    },
    /// Move an item to another folder
    #[command(name = "mv")]
    Move {
        /// Item ID or unique ID prefix
        id: String,
        /// Destination folder; the root when omitted
        #[arg(long, value_name = "ID")]
        to: Option<String>,
    },
    /// Delete an existing item
    Delete {
        /// Item ID or unique ID prefix
        id: String,
    },
    /// Run one sync session against the configured target
    Sync,
    /// Show sync status for the configured target
    Status {
        /// Also list locks present on the target
        #[arg(long)]
        remote: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Maintain the sync target
    Target {
        #[command(subcommand)]
        command: TargetCommands,
    },
    /// Configure CLI profiles
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Subcommand)]
pub enum TargetCommands {
    /// Delete everything on the target and queue all local items for upload
    Format {
        /// Confirm the target contents may be destroyed
        #[arg(long)]
        yes: bool,
    },
    /// List locks currently held on the target
    Locks,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Set the sync target of a profile
    SetTarget {
        /// Target URI
        uri: String,
        /// Keep current active profile instead of activating this one
        #[arg(long)]
        no_activate: bool,
    },
    /// Show the resolved profile
    Show,
}
