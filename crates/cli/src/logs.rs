//! The `logs` command: parse the surface flags into stream options, start
//! the stream, render the table.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgGroup, Args};
use tracing::debug;

use kubetail_core::cursor::encode_tail_cursor;
use kubetail_core::timearg::parse_time_arg;
use kubetail_core::{SourceExpr, SourceFilter, StreamMode};
use kubetail_kubehub::ConnectionManager;
use kubetail_stream::{LogStream, LogStreamOptions};

use crate::colors::DotColors;
use crate::config::{self, FileConfig};
use crate::render::{default_columns, resolve_columns, Column, Renderer};

const DEFAULT_WINDOW: u64 = 10;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("mode").args(["head", "tail", "all"])))]
pub struct LogsArgs {
    /// Source expressions, e.g. `web-abc123`, `prod:deployments/web/nginx`,
    /// `*:cronjobs/backup-*`
    #[arg(required = true)]
    pub sources: Vec<String>,

    /// Oldest records first, optionally capped at N
    #[arg(long, num_args = 0..=1, require_equals = true)]
    pub head: Option<Option<u64>>,
    /// Newest N records, oldest-first within the block
    #[arg(long, num_args = 0..=1, require_equals = true)]
    pub tail: Option<Option<u64>>,
    /// The whole window, no cap
    #[arg(long)]
    pub all: bool,
    /// Keep streaming new records after the historical window
    #[arg(long, short = 'f')]
    pub follow: bool,

    /// Lower time bound: ISO-8601 duration (PT30M) or RFC-3339 timestamp
    #[arg(long)]
    pub since: Option<String>,
    /// Upper time bound, same syntax
    #[arg(long)]
    pub until: Option<String>,
    /// Exclusive lower bound (= --since + 1ns)
    #[arg(long, conflicts_with = "since")]
    pub after: Option<String>,
    /// Exclusive upper bound (= --until - 1ns)
    #[arg(long, conflicts_with = "until")]
    pub before: Option<String>,

    /// Regular expression filter; requires --force
    #[arg(long)]
    pub grep: Option<String>,
    /// Acknowledge that --grep scans full log content
    #[arg(long)]
    pub force: bool,

    /// Restrict to nodes in these regions
    #[arg(long = "region")]
    pub regions: Vec<String>,
    /// Restrict to nodes in these availability zones
    #[arg(long = "zone")]
    pub zones: Vec<String>,
    /// Restrict to nodes running these operating systems
    #[arg(long = "os")]
    pub oses: Vec<String>,
    /// Restrict to nodes with these CPU architectures
    #[arg(long = "arch")]
    pub arches: Vec<String>,
    /// Restrict to these nodes
    #[arg(long = "node")]
    pub nodes: Vec<String>,

    #[arg(long)]
    pub kube_context: Option<String>,
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,
    /// Use the service account instead of a kubeconfig
    #[arg(long)]
    pub in_cluster: bool,

    /// Replace the column list (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub columns: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub add_columns: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub remove_columns: Vec<String>,

    /// Print paging cursors to stderr when the window completes
    #[arg(long)]
    pub with_cursors: bool,
    /// Bare messages, no table
    #[arg(long)]
    pub raw: bool,
    #[arg(long)]
    pub hide_header: bool,
}

impl LogsArgs {
    fn stream_mode(&self, defaults: &config::LogsDefaults) -> StreamMode {
        if self.all {
            return StreamMode::All;
        }
        if let Some(n) = self.head {
            return StreamMode::Head(n.or(defaults.head).unwrap_or(DEFAULT_WINDOW));
        }
        if let Some(n) = self.tail {
            return StreamMode::Tail(n.or(defaults.tail).unwrap_or(DEFAULT_WINDOW));
        }
        if self.follow {
            // Follow alone: no history, live records from now.
            return StreamMode::Tail(0);
        }
        StreamMode::Tail(defaults.tail.unwrap_or(DEFAULT_WINDOW))
    }
}

pub async fn run(args: LogsArgs, config: FileConfig) -> Result<i32> {
    if args.grep.is_some() && !args.force {
        bail!("--grep scans full log content; pass --force to confirm");
    }
    let now = Utc::now();
    let mut since = args.since.as_deref().map(|s| parse_time_arg(s, now)).transpose()?;
    if let Some(after) = args.after.as_deref() {
        since = Some(parse_time_arg(after, now)? + chrono::Duration::nanoseconds(1));
    }
    let mut until = args.until.as_deref().map(|s| parse_time_arg(s, now)).transpose()?;
    if let Some(before) = args.before.as_deref() {
        until = Some(parse_time_arg(before, now)? - chrono::Duration::nanoseconds(1));
    }

    let exprs = SourceExpr::parse_all(&args.sources)?;
    let cm = if args.in_cluster {
        ConnectionManager::in_cluster()
    } else {
        ConnectionManager::desktop(args.kubeconfig.clone().or(config.general.kubeconfig.clone()))
    };
    let opts = LogStreamOptions {
        mode: args.stream_mode(&config.commands.logs),
        follow: args.follow,
        since,
        until,
        grep: args.grep.clone(),
        filter: SourceFilter {
            regions: args.regions.clone(),
            zones: args.zones.clone(),
            oses: args.oses.clone(),
            arches: args.arches.clone(),
            nodes: args.nodes.clone(),
        },
        context: args.kube_context.clone().or(config.commands.logs.kube_context.clone()),
        ..Default::default()
    };
    debug!(mode = %opts.mode, follow = opts.follow, sources = args.sources.len(), "logs starting");

    let mut stream = LogStream::new(Arc::new(cm), exprs, opts);
    stream.start().await.context("starting log stream")?;
    let mut rx = stream.records().context("taking record channel")?;

    let base = match &config.commands.logs.columns {
        Some(cols) => cols
            .iter()
            .map(|s| Column::parse(s))
            .collect::<Result<Vec<_>>>()
            .context("commands.logs.columns")?,
        None => default_columns(),
    };
    let columns =
        resolve_columns(base, &args.columns, &args.add_columns, &args.remove_columns)?;
    let colors = if !args.raw && columns.contains(&Column::Dot) {
        let state_dir = config::kubetail_dir()
            .context("cannot locate home directory for color state")?
            .join("state");
        Some(DotColors::open(&state_dir)?)
    } else {
        None
    };
    let mut renderer =
        Renderer::new(columns, &stream.sources(), args.raw, args.hide_header, colors);
    if let Some(header) = renderer.header_line() {
        println!("{header}");
    }

    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                stream.close();
                break;
            }
            record = rx.recv() => match record {
                Some(record) => println!("{}", renderer.format_record(&record)),
                None => break,
            }
        }
    }
    if interrupted {
        // Graceful drain: whatever the engine already merged still prints.
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(record) = rx.recv().await {
                println!("{}", renderer.format_record(&record));
            }
        })
        .await;
    }

    if args.with_cursors {
        for (key, cursor) in stream.tail_cursors() {
            eprintln!("cursor {key} {}", encode_tail_cursor(&cursor)?);
        }
    }
    renderer.finish()?;

    if let Some(e) = stream.err() {
        eprintln!("kubetail: {e}");
        return Ok(1);
    }
    Ok(if interrupted { 130 } else { 0 })
}
