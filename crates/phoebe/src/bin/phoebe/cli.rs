//! CLI definitions for phoebe.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "phoebe",
    version,
    about = "Gemini and Titan wiki server",
    after_help = "Examples:\n  phoebe                                # serve ./wiki on port 1965\n  phoebe --host example.org --wiki_dir /srv/wiki\n  phoebe --host example.org --wiki_space alpha --wiki_token sesame\n  phoebe --wiki_mime_type image/jpeg    # allow jpeg uploads"
)]
pub struct Cli {
    /// Hostname to serve (repeatable; default localhost).
    #[arg(long = "host")]
    pub hosts: Vec<String>,

    /// Port to listen on (repeatable; default 1965).
    #[arg(long = "port")]
    pub ports: Vec<u16>,

    /// PEM certificate file, bound to the matching --host (repeatable).
    #[arg(long = "cert_file")]
    pub cert_files: Vec<PathBuf>,

    /// PEM private key file, bound to the matching --host (repeatable).
    #[arg(long = "key_file")]
    pub key_files: Vec<PathBuf>,

    /// Wiki data directory.
    #[arg(long = "wiki_dir", env = "PHOEBE_DATA_DIR", default_value = "./wiki")]
    pub wiki_dir: PathBuf,

    /// Extra wiki space, `space` or `host/space` (repeatable).
    #[arg(long = "wiki_space")]
    pub wiki_spaces: Vec<String>,

    /// Write token (repeatable; default `hello`).
    #[arg(long = "wiki_token")]
    pub wiki_tokens: Vec<String>,

    /// Extra main-menu page (repeatable).
    #[arg(long = "wiki_page")]
    pub wiki_pages: Vec<String>,

    /// Page transcluded at the top of the main menu.
    #[arg(long = "wiki_main_page")]
    pub wiki_main_page: Option<String>,

    /// Allowed upload MIME type, literal like `image/jpeg` or a bare major
    /// type like `image` (repeatable).
    #[arg(long = "wiki_mime_type")]
    pub wiki_mime_types: Vec<String>,

    /// Upload size limit in bytes.
    #[arg(long = "wiki_page_size_limit", default_value_t = 10_000)]
    pub wiki_page_size_limit: u64,

    /// Log verbosity: 0 silent, 1 errors, 2 warnings, 3 requests, 4 traces.
    #[arg(long = "log_level", default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=4))]
    pub log_level: u8,

    /// Append logs to this file instead of stderr.
    #[arg(long = "log_file")]
    pub log_file: Option<PathBuf>,

    /// Write the server PID to this file after binding.
    #[arg(long = "pid_file")]
    pub pid_file: Option<PathBuf>,

    /// Start a new session, detaching from the controlling terminal (unix).
    #[arg(long = "setsid")]
    pub setsid: bool,

    /// Drop privileges to this user after binding (unix).
    #[arg(long = "user")]
    pub user: Option<String>,

    /// Drop privileges to this group after binding (unix).
    #[arg(long = "group")]
    pub group: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
