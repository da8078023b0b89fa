//! Command line arguments

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use snowcache_engine::prelude::{ExportFormat, ExtendedFilter, ScanQuery, SortOrder};

/// snowcache - run warehouse queries into a local result cache
///
/// Engine limits are read from `SNOWCACHE_*` environment variables
/// (for example `SNOWCACHE_MAX_CONCURRENT=10`).
#[derive(Parser, Debug)]
#[command(name = "snowcache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Upstream warehouse URL
    #[arg(long, default_value = "sqlite://warehouse.db", env = "SNOWCACHE_UPSTREAM_URL")]
    pub upstream_url: String,

    /// Cache store file (overrides SNOWCACHE_DB_PATH)
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// User the sessions belong to
    #[arg(short, long, default_value = "local", env = "SNOWCACHE_USER")]
    pub user: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", env = "RUST_LOG")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a SELECT and cache its rows
    Run {
        /// SQL statement
        statement: String,

        /// Cache at most this many rows
        #[arg(long)]
        limit: Option<u64>,

        /// Skip the display gate (result is meant for export)
        #[arg(long)]
        download_only: bool,

        /// Rows of the first page to print
        #[arg(long, default_value = "20")]
        page_size: usize,
    },

    /// Print one page of a cached result
    Read {
        /// Session id
        session: String,

        /// Page number, starting at 1
        #[arg(short, long, default_value = "1")]
        page: usize,

        /// Rows per page
        #[arg(long, default_value = "100")]
        page_size: usize,

        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Distinct values of one column
    Unique {
        /// Session id
        session: String,

        /// Column name
        column: String,

        /// Maximum values returned
        #[arg(long, default_value = "100")]
        limit: usize,

        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Export a cached result to a file
    Export {
        /// Session id
        session: String,

        /// Output format
        #[arg(short, long, value_enum, default_value = "csv")]
        format: FormatArg,

        /// Requested file name (sanitized)
        #[arg(long)]
        filename: Option<String>,

        /// Directory the file is written to
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        #[command(flatten)]
        scan: ScanArgs,
    },

    /// List the user's sessions
    Sessions,

    /// Show one session
    Status {
        /// Session id
        session: String,
    },

    /// Cancel a running session
    Cancel {
        /// Session id
        session: String,
    },

    /// Remove sessions and their cached rows
    Cleanup {
        /// Session id; omit with --all to remove every session of the user
        session: Option<String>,

        /// Remove every session of the user
        #[arg(long, conflicts_with = "session")]
        all: bool,
    },

    /// Run one janitor pass
    Sweep,

    /// Run the janitor periodically until interrupted
    Janitor,

    /// Check the upstream connection
    Ping,
}

/// Export formats accepted on the command line
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatArg {
    Csv,
    Tsv,
    Xlsx,
    Clipboard,
}

impl From<FormatArg> for ExportFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Csv => ExportFormat::Csv,
            FormatArg::Tsv => ExportFormat::Tsv,
            FormatArg::Xlsx => ExportFormat::Xlsx,
            FormatArg::Clipboard => ExportFormat::Clipboard,
        }
    }
}

/// Filter and sort options shared by read, unique and export
#[derive(clap::Args, Debug, Default)]
pub struct ScanArgs {
    /// Keep rows whose column has one of the values: `column=v1,v2`
    #[arg(long = "filter", value_name = "COLUMN=VALUES")]
    pub filters: Vec<String>,

    /// Extended predicate as JSON: `{"column":"age","op":">","value":18}`
    #[arg(long = "where", value_name = "JSON")]
    pub predicates: Vec<String>,

    /// Sort column
    #[arg(long)]
    pub sort_by: Option<String>,

    /// Sort descending
    #[arg(long)]
    pub desc: bool,
}

impl ScanArgs {
    /// Build the engine scan query
    pub fn to_scan(&self) -> anyhow::Result<ScanQuery> {
        let mut filters: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for raw in &self.filters {
            let (column, values) = parse_filter(raw)?;
            filters.entry(column).or_default().extend(values);
        }

        let extended_filters = self
            .predicates
            .iter()
            .map(|raw| {
                serde_json::from_str::<ExtendedFilter>(raw)
                    .map_err(|e| anyhow::anyhow!("invalid --where '{}': {}", raw, e))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(ScanQuery {
            filters,
            extended_filters,
            sort_by: self.sort_by.clone(),
            sort_order: if self.desc { SortOrder::Desc } else { SortOrder::Asc },
        })
    }
}

/// Parse `column=v1,v2`
fn parse_filter(raw: &str) -> anyhow::Result<(String, Vec<String>)> {
    let (column, values) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid --filter '{}': expected COLUMN=VALUES", raw))?;
    let column = column.trim();
    if column.is_empty() {
        anyhow::bail!("invalid --filter '{}': empty column", raw);
    }
    let values = values.split(',').map(|v| v.trim().to_string()).collect();
    Ok((column.to_string(), values))
}
