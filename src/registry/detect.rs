//! On-disk weight detection for registry entries

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::Serialize;

/// Detected weights format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WeightsFormat {
    /// SafeTensors (HuggingFace standard), possibly sharded
    SafeTensors,
    /// GGUF (llama.cpp, quantized models)
    Gguf,
}

impl std::fmt::Display for WeightsFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WeightsFormat::SafeTensors => f.write_str("SafeTensors"),
            WeightsFormat::Gguf => f.write_str("GGUF"),
        }
    }
}

/// Weights located for a model
#[derive(Debug, Clone, Serialize)]
pub struct WeightsSource {
    /// Every weights file (one entry unless sharded)
    pub files: Vec<PathBuf>,
    /// Config file next to the weights, if any
    pub config_path: Option<PathBuf>,
    pub format: WeightsFormat,
}

impl WeightsSource {
    /// Total size of the weights files in bytes
    pub fn total_bytes(&self) -> u64 {
        self.files
            .iter()
            .filter_map(|f| std::fs::metadata(f).ok())
            .map(|m| m.len())
            .sum()
    }
}

/// Locate the weights behind a registry path
///
/// The path can be:
/// - A directory containing model files
/// - A direct path to a .safetensors file
/// - A direct path to a .gguf file
pub fn detect_weights<P: AsRef<Path>>(path: P) -> Result<WeightsSource> {
    let path = path.as_ref();

    if path.is_file() {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "safetensors" => Ok(WeightsSource {
                files: vec![path.to_path_buf()],
                config_path: path.parent().and_then(find_config_in_dir),
                format: WeightsFormat::SafeTensors,
            }),
            "gguf" => Ok(WeightsSource {
                files: vec![path.to_path_buf()],
                config_path: None, // GGUF has embedded metadata
                format: WeightsFormat::Gguf,
            }),
            _ => Err(anyhow!("Unsupported model file format: .{}", ext)),
        }
    } else if path.is_dir() {
        detect_in_directory(path)
    } else {
        Err(anyhow!("Model path does not exist: {}", path.display()))
    }
}

fn detect_in_directory(dir: &Path) -> Result<WeightsSource> {
    // SafeTensors first (preferred)
    for name in ["model.safetensors", "pytorch_model.safetensors"] {
        let candidate = dir.join(name);
        if candidate.exists() {
            return Ok(WeightsSource {
                files: vec![candidate],
                config_path: find_config_in_dir(dir),
                format: WeightsFormat::SafeTensors,
            });
        }
    }

    let shards = glob_files(dir, "model-*-of-*.safetensors");
    if !shards.is_empty() {
        return Ok(WeightsSource {
            files: shards,
            config_path: find_config_in_dir(dir),
            format: WeightsFormat::SafeTensors,
        });
    }

    if let Some(gguf) = glob_files(dir, "*.gguf").into_iter().next() {
        return Ok(WeightsSource {
            files: vec![gguf],
            config_path: None,
            format: WeightsFormat::Gguf,
        });
    }

    Err(anyhow!(
        "No supported model files found in directory: {}",
        dir.display()
    ))
}

fn find_config_in_dir(dir: &Path) -> Option<PathBuf> {
    ["config.json", "config.yaml", "config.yml"]
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.exists())
}

/// Files matching a glob pattern inside `dir`, sorted
fn glob_files(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let full_pattern = dir.join(pattern);
    let Some(pattern) = full_pattern.to_str() else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = glob::glob(pattern)
        .map(|paths| paths.filter_map(|r| r.ok()).collect())
        .unwrap_or_default();
    files.sort();
    files
}
