use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Image fetching and caching tool",
    long_about = "Fetches images through a two-tier memory and disk cache.\n\
                  \n\
                  Concurrent requests for the same image share one download, failed\n\
                  downloads can be retried and fall back to mirror URLs, and the disk\n\
                  cache can be inspected, swept and cleared."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Directory of the disk cache
    #[arg(long, global = true, help = "Disk cache directory (default: <temp>/pixcache/<name>)")]
    pub cache_dir: Option<PathBuf>,

    /// Cache name, used for the default directory
    #[arg(long, global = true, default_value = "default")]
    pub cache_name: String,

    /// Maximum disk cache size with optional unit (B, KB, MB, GB)
    #[arg(
        long,
        global = true,
        default_value = "0",
        help = "Disk cache size limit with optional unit (B, KB, MB, GB). Use 0 for unlimited."
    )]
    pub disk_limit: String,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Overall HTTP request timeout in seconds
    #[arg(long, global = true, default_value = "15")]
    pub timeout: u64,

    /// Custom User-Agent header
    #[arg(short = 'u', long, global = true)]
    pub user_agent: Option<String>,

    /// Extra request headers
    #[arg(
        short = 'H',
        long = "header",
        global = true,
        help = "Add a request header in \"Name: Value\" form (repeatable)"
    )]
    pub headers: Vec<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Retrieve images and optionally write them out
    Fetch {
        /// Image URLs
        #[arg(required = true)]
        urls: Vec<String>,

        /// Mirror URLs tried in order when a download fails
        #[arg(long = "alt")]
        alternatives: Vec<String>,

        /// Retries per source for server and transport errors
        #[arg(short, long, default_value = "0")]
        retries: u32,

        /// Seconds between retries
        #[arg(long, default_value = "1.0")]
        retry_interval: f64,

        /// Skip the cache lookup
        #[arg(short, long)]
        force: bool,

        /// Write the retrieved images into this directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Warm the cache for many images
    Prefetch {
        /// Image URLs
        #[arg(required = true)]
        urls: Vec<String>,

        /// Downloads in flight at once
        #[arg(short, long, default_value = "5")]
        concurrency: usize,
    },

    /// Show which cache tier holds each image
    Status {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Remove expired entries and trim the disk cache to its limit
    Clean,

    /// Remove every cached image
    Clear,
}
