//! `render_altair` tool: stores Vega-Lite specs produced by the model.

use anyhow::{bail, Context};
use async_trait::async_trait;
use intellisolve::{Schema, ToolDeclaration, ToolHandler};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

pub const TOOL_NAME: &str = "render_altair";

pub fn declaration() -> ToolDeclaration {
    ToolDeclaration::new(TOOL_NAME, "Displays an altair graph in json format.").with_parameters(
        Schema::object()
            .property(
                "json_graph",
                Schema::string().describe(
                    "JSON STRING representation of the graph to render. Must be a string, not a json object",
                ),
            )
            .require("json_graph"),
    )
}

/// Writes each chart to `<dir>/chart-<n>.vl.json`.
pub struct ChartWriter {
    dir: PathBuf,
    next: AtomicU64,
}

impl ChartWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ToolHandler for ChartWriter {
    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        let Some(raw) = args.get("json_graph").and_then(Value::as_str) else {
            bail!("json_graph must be a string");
        };
        let graph: Value = serde_json::from_str(raw).context("json_graph is not valid JSON")?;
        if !graph.is_object() {
            bail!("json_graph must encode a JSON object");
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("cannot create {}", self.dir.display()))?;
        let path = self
            .dir
            .join(format!("chart-{}.vl.json", self.next.fetch_add(1, Ordering::Relaxed)));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&graph)?)
            .await
            .with_context(|| format!("cannot write {}", path.display()))?;

        info!("Chart saved to {}", path.display());
        Ok(json!({ "success": true }))
    }
}
