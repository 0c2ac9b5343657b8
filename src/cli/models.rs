//! Models command

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::BerthConfig;
use crate::registry::{detect_weights, ModelDescriptor, ModelRegistry};

/// List registered models and check their weights on disk
pub async fn models(config_path: Option<PathBuf>, verbose: bool) -> Result<()> {
    let config = BerthConfig::load(config_path.as_deref())?;
    let registry = ModelRegistry::from_config(&config.models)?;

    if registry.is_empty() {
        println!("No models registered.");
        println!("\nAdd entries under `models.registry` in the config file.");
    } else {
        println!(
            "Registered models (pool capacity {}):\n",
            config.models.max_loaded_models
        );
        for descriptor in registry.by_importance() {
            if verbose {
                print_model_details(&descriptor);
            } else {
                println!(
                    "  {} (weight {}, {})",
                    descriptor.name,
                    descriptor.priority_weight,
                    format_summary(&descriptor.path)
                );
            }
        }
    }

    let unregistered = unregistered_files(&config.models.model_dir, &registry);
    if !unregistered.is_empty() {
        println!("\nUnregistered weights in {}:", config.models.model_dir.display());
        for path in unregistered {
            println!("  {}", path.display());
        }
    }

    Ok(())
}

fn format_summary(path: &Path) -> String {
    match detect_weights(path) {
        Ok(source) => format!("{}, {}", source.format, format_size(source.total_bytes())),
        Err(_) => "missing".to_string(),
    }
}

fn format_size(bytes: u64) -> String {
    let size_mb = bytes as f64 / (1024.0 * 1024.0);
    if size_mb > 1024.0 {
        format!("{:.2} GB", size_mb / 1024.0)
    } else {
        format!("{:.2} MB", size_mb)
    }
}

fn print_model_details(descriptor: &ModelDescriptor) {
    println!("  {}", descriptor.name);
    println!("    Path: {}", descriptor.path.display());
    println!("    Priority weight: {}", descriptor.priority_weight);
    println!("    Device: {}", descriptor.device);
    if let Some(dtype) = descriptor.dtype {
        println!("    DType: {}", dtype);
    }

    match detect_weights(&descriptor.path) {
        Ok(source) => {
            println!("    Format: {}", source.format);
            println!("    Files: {}", source.files.len());
            println!("    Size: {}", format_size(source.total_bytes()));

            // Architecture hints from config.json, when present
            if let Some(config) = source
                .config_path
                .as_deref()
                .and_then(|p| std::fs::read_to_string(p).ok())
                .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            {
                if let Some(hidden_size) = config.get("hidden_size").and_then(|v| v.as_u64()) {
                    println!("    Hidden size: {}", hidden_size);
                }
                if let Some(num_layers) = config.get("num_hidden_layers").and_then(|v| v.as_u64()) {
                    println!("    Layers: {}", num_layers);
                }
            }
        }
        Err(e) => println!("    Weights: {}", e),
    }

    println!();
}

/// Weight files and model directories under `model_dir` that no registry
/// entry points at
fn unregistered_files(model_dir: &Path, registry: &ModelRegistry) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(model_dir) else {
        return Vec::new();
    };
    let registered: HashSet<&Path> = registry.iter().map(|d| d.path.as_path()).collect();

    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| !registered.contains(path.as_path()))
        .filter(|path| detect_weights(path).is_ok())
        .collect();
    found.sort();
    found
}
