//! Generates the OpenAPI specification to a JSON file.
//!
//! Run with: cargo run --bin gen-openapi -p gasmask-server
//!
//! The generated file is placed in the workspace root, where the companion
//! app's TypeScript client generator picks it up.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;

fn main() -> anyhow::Result<()> {
    println!("Generating OpenAPI specification...\n");

    // Generate the OpenAPI spec as JSON
    let json = gasmask_server::api::get_openapi_json()?;

    // Get project root (workspace root)
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let workspace_root = manifest_dir
        .parent()
        .and_then(|p| p.parent())
        .context("Could not find workspace root")?;

    // Output path in workspace root
    let output_path = workspace_root.join("openapi.json");

    fs::write(&output_path, &json)
        .with_context(|| format!("Failed to write to {}", output_path.display()))?;

    println!("Written to: {}", output_path.display());

    // Parse to count paths and schemas
    let spec: serde_json::Value = serde_json::from_str(&json)?;
    if let Some(paths) = spec.get("paths").and_then(|p| p.as_object()) {
        println!("Paths: {}", paths.len());
    }
    if let Some(schemas) = spec
        .pointer("/components/schemas")
        .and_then(|s| s.as_object())
    {
        println!("Schemas: {}", schemas.len());
    }

    println!("\nOpenAPI specification generated successfully!");
    Ok(())
}
