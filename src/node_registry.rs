use std::path::Path;

use crate::{
    data_model::{NodeConfig, NodeId, QueueMethod},
    error::{DispatchError, Result},
};

/// Loads the compute-node registry: one node per line,
/// `host<ws>queue_method`, `#` comments and blank lines skipped. File order
/// is preserved; it is the tie-break order for node selection.
///
/// Any malformed line fails the whole load with `ConfigError`; the caller
/// degrades to an empty registry so the cycle keeps polling already
/// dispatched jobs without submitting new ones.
pub fn load(path: &Path) -> Result<Vec<NodeConfig>> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        DispatchError::Config(format!(
            "cannot read node registry {}: {err}",
            path.display()
        ))
    })?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Vec<NodeConfig>> {
    let mut nodes: Vec<NodeConfig> = Vec::new();
    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let host = fields.next().unwrap_or_default();
        let method = fields.next().ok_or_else(|| {
            DispatchError::Config(format!(
                "node registry line {}: missing queue method",
                lineno + 1
            ))
        })?;
        let queue_method = method.parse::<QueueMethod>().map_err(|_| {
            DispatchError::Config(format!(
                "node registry line {}: unknown queue method {method:?}",
                lineno + 1
            ))
        })?;
        let id = NodeId::from(host);
        // a repeated host updates the earlier entry in place, keeping its
        // position in the tie-break order
        match nodes.iter_mut().find(|n| n.id == id) {
            Some(existing) => existing.queue_method = queue_method,
            None => nodes.push(NodeConfig { id, queue_method }),
        }
    }
    Ok(nodes)
}
