//! Table rendering: column selection, widths computed from the live
//! endpoint set, and stable per-container dot colors.

use std::fmt::Write as _;

use anyhow::{bail, Result};
use crossterm::style::Stylize;

use kubetail_core::{LogRecord, LogSource};

use crate::colors::DotColors;

const TIMESTAMP_WIDTH: usize = 30; // RFC-3339 with nanoseconds

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Timestamp,
    Dot,
    Namespace,
    Pod,
    Container,
    Node,
    Region,
    Zone,
    Os,
    Arch,
    Message,
}

impl Column {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "timestamp" | "ts" => Column::Timestamp,
            "dot" => Column::Dot,
            "namespace" | "ns" => Column::Namespace,
            "pod" => Column::Pod,
            "container" => Column::Container,
            "node" => Column::Node,
            "region" => Column::Region,
            "zone" => Column::Zone,
            "os" => Column::Os,
            "arch" => Column::Arch,
            "message" => Column::Message,
            other => bail!("unknown column {other:?}"),
        })
    }

    fn header(&self) -> &'static str {
        match self {
            Column::Timestamp => "TIMESTAMP",
            Column::Dot => "",
            Column::Namespace => "NAMESPACE",
            Column::Pod => "POD",
            Column::Container => "CONTAINER",
            Column::Node => "NODE",
            Column::Region => "REGION",
            Column::Zone => "ZONE",
            Column::Os => "OS",
            Column::Arch => "ARCH",
            Column::Message => "MESSAGE",
        }
    }

    fn value<'a>(&self, source: &'a LogSource) -> &'a str {
        match self {
            Column::Namespace => &source.namespace,
            Column::Pod => &source.pod_name,
            Column::Container => &source.container_name,
            Column::Node => &source.meta.node,
            Column::Region => &source.meta.region,
            Column::Zone => &source.meta.zone,
            Column::Os => &source.meta.os,
            Column::Arch => &source.meta.arch,
            Column::Timestamp | Column::Dot | Column::Message => "",
        }
    }
}

pub fn default_columns() -> Vec<Column> {
    vec![Column::Timestamp, Column::Dot, Column::Pod, Column::Container, Column::Message]
}

/// Applies `--columns` / `--add-columns` / `--remove-columns` over a base
/// column list.
pub fn resolve_columns(
    base: Vec<Column>,
    columns: &[String],
    add: &[String],
    remove: &[String],
) -> Result<Vec<Column>> {
    let mut out = if columns.is_empty() {
        base
    } else {
        columns.iter().map(|s| Column::parse(s)).collect::<Result<Vec<_>>>()?
    };
    for s in add {
        let col = Column::parse(s)?;
        if !out.contains(&col) {
            // Added columns keep the message last.
            let at = out.iter().position(|c| *c == Column::Message).unwrap_or(out.len());
            out.insert(at, col);
        }
    }
    for s in remove {
        let col = Column::parse(s)?;
        out.retain(|c| *c != col);
    }
    if out.is_empty() {
        bail!("no columns left to render");
    }
    Ok(out)
}

pub struct Renderer {
    columns: Vec<Column>,
    widths: Vec<usize>,
    raw: bool,
    hide_header: bool,
    colors: Option<DotColors>,
}

impl Renderer {
    /// Column widths come from the live endpoint set so the table stays
    /// aligned; widths still grow if a later value exceeds them.
    pub fn new(
        columns: Vec<Column>,
        sources: &[LogSource],
        raw: bool,
        hide_header: bool,
        colors: Option<DotColors>,
    ) -> Self {
        let widths = columns
            .iter()
            .map(|col| match col {
                Column::Timestamp => TIMESTAMP_WIDTH,
                Column::Dot => 1,
                Column::Message => 0,
                _ => sources
                    .iter()
                    .map(|s| col.value(s).len())
                    .chain(std::iter::once(col.header().len()))
                    .max()
                    .unwrap_or(0),
            })
            .collect();
        Self { columns, widths, raw, hide_header, colors }
    }

    pub fn header_line(&self) -> Option<String> {
        if self.raw || self.hide_header {
            return None;
        }
        let mut line = String::new();
        for (col, width) in self.columns.iter().zip(&self.widths) {
            if *col == Column::Message {
                let _ = write!(line, "{}", col.header());
            } else {
                let _ = write!(line, "{:<w$} ", col.header(), w = width);
            }
        }
        Some(line.trim_end().to_string())
    }

    pub fn format_record(&mut self, record: &LogRecord) -> String {
        if self.raw {
            return record.message.clone();
        }
        let mut line = String::new();
        for (i, col) in self.columns.iter().enumerate() {
            match col {
                Column::Timestamp => {
                    let ts = record
                        .timestamp
                        .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
                    let _ = write!(line, "{:<w$} ", ts, w = self.widths[i]);
                }
                Column::Dot => {
                    let dot = match self.colors.as_mut() {
                        Some(colors) => {
                            let color = colors.color_for(&record.source.container_id);
                            format!("{}", "●".with(color))
                        }
                        None => "●".to_string(),
                    };
                    let _ = write!(line, "{dot} ");
                }
                Column::Message => {
                    let _ = write!(line, "{}", record.message);
                }
                _ => {
                    let value = col.value(&record.source);
                    if value.len() > self.widths[i] {
                        self.widths[i] = value.len();
                    }
                    let _ = write!(line, "{:<w$} ", value, w = self.widths[i]);
                }
            }
        }
        line.trim_end().to_string()
    }

    /// Flushes the color state file.
    pub fn finish(self) -> Result<()> {
        if let Some(colors) = self.colors {
            colors.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use kubetail_core::SourceMeta;

    fn source(pod: &str, container: &str) -> LogSource {
        LogSource {
            namespace: "default".into(),
            pod_name: pod.into(),
            container_name: container.into(),
            container_id: format!("containerd://{pod}-{container}"),
            meta: SourceMeta { node: "node-1".into(), ..Default::default() },
        }
    }

    fn record(pod: &str, message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            message: message.into(),
            source: source(pod, "main"),
            approximate: false,
        }
    }

    #[test]
    fn column_parsing_and_overrides() {
        let cols = resolve_columns(
            default_columns(),
            &[],
            &["node".into()],
            &["container".into()],
        )
        .unwrap();
        assert!(cols.contains(&Column::Node));
        assert!(!cols.contains(&Column::Container));
        // message stays last
        assert_eq!(*cols.last().unwrap(), Column::Message);

        assert!(Column::parse("bogus").is_err());
        assert!(resolve_columns(default_columns(), &[], &[], &[
            "timestamp".into(), "dot".into(), "pod".into(), "container".into(), "message".into(),
        ])
        .is_err());
    }

    #[test]
    fn widths_from_sources() {
        let sources = vec![source("a-very-long-pod-name", "main"), source("b", "main")];
        let mut r = Renderer::new(
            vec![Column::Pod, Column::Message],
            &sources,
            false,
            false,
            None,
        );
        let header = r.header_line().unwrap();
        assert!(header.starts_with("POD"));
        let line = r.format_record(&record("b", "hello"));
        // short pod padded to the widest name
        assert_eq!(line.find("hello").unwrap(), "a-very-long-pod-name ".len());
    }

    #[test]
    fn raw_mode_prints_bare_messages() {
        let mut r = Renderer::new(default_columns(), &[], true, false, None);
        assert_eq!(r.format_record(&record("a", "just the message")), "just the message");
        assert!(r.header_line().is_none());
    }

    #[test]
    fn hidden_header() {
        let r = Renderer::new(default_columns(), &[], false, true, None);
        assert!(r.header_line().is_none());
    }
}
