//! Kubetail kube integration: cached client construction, default-namespace
//! resolution, node placement metadata and multi-namespace pod listing.

#![forbid(unsafe_code)]

mod conn;
mod list;
mod nodes;

pub use conn::{ClientMode, ConnectionManager, DEFAULT_NAMESPACE};
pub use list::{list_pods_multi, merge_pages, MergedPage, NsPage};
pub use nodes::{node_meta_map, source_meta_for_node};
