use std::io::Read;

use anyhow::{Context, Result};
use sediment::Engine;
use serde_json::Value;

use super::open_index;

pub fn get_doc(engine: &Engine, index: &str, id: &str) -> Result<()> {
    let doc = open_index(engine, index)?
        .get_source_data(id)
        .with_context(|| format!("Document '{}' not found in '{}'", id, index))?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

/// Store a document. Without `json`, the body is read from stdin.
pub fn put_doc(engine: &Engine, index: &str, id: &str, json: Option<&str>) -> Result<()> {
    let body = match json {
        Some(json) => json.to_string(),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let doc: Value = serde_json::from_str(&body).context("Document body is not valid JSON")?;
    open_index(engine, index)?.set_source_data(id, &doc)?;
    tracing::info!(index, id, "stored document");
    Ok(())
}

pub fn delete_doc(engine: &Engine, index: &str, id: &str) -> Result<()> {
    open_index(engine, index)?.delete_source_data(id)?;
    tracing::info!(index, id, "deleted document");
    Ok(())
}
