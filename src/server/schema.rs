//! Route schema publication.
//!
//! At startup the server writes a machine-readable description of its
//! registered routes to `rpc.schema.json` in the rpc tree, so peers can
//! discover what the app serves without reading its code.

use super::routes::RouteTable;
use super::ServerError;
use serde_json::json;
use std::path::Path;

/// Filename of the published schema.
pub const SCHEMA_FILENAME: &str = "rpc.schema.json";

/// Write `rpc.schema.json` for the registered routes.
pub async fn publish_schema(rpc_dir: &Path, routes: &RouteTable) -> Result<(), ServerError> {
    let mut schema = serde_json::Map::new();
    for pattern in routes.patterns() {
        let key = if pattern.starts_with('/') {
            pattern.to_string()
        } else {
            format!("/{pattern}")
        };
        schema.insert(
            key,
            json!({
                "request": {"content": "bytes"},
                "response": {"content": "bytes"},
            }),
        );
    }

    let body = serde_json::to_vec_pretty(&serde_json::Value::Object(schema))
        .map_err(|e| ServerError::Schema(e.to_string()))?;
    crate::rpc::write_atomic(&rpc_dir.join(SCHEMA_FILENAME), &body).await?;
    Ok(())
}
