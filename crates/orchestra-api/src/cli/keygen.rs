//! `orch keygen`: create the Ed25519 keypair used to sign audit records.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use console::style;
use orchestra_infra::crypto::{generate_keypair, key_fingerprint};
use serde_json::json;

/// `<data_dir>/keys/audit` unless an explicit prefix is given.
pub fn default_prefix(data_dir: &Path) -> PathBuf {
    data_dir.join("keys").join("audit")
}

pub fn keygen(data_dir: &Path, output: Option<PathBuf>, json: bool) -> Result<()> {
    let prefix = output.unwrap_or_else(|| default_prefix(data_dir));
    let (paths, public) = generate_keypair(&prefix).context("failed to generate keypair")?;
    let fingerprint = key_fingerprint(&public);

    if json {
        let out = json!({
            "secret": paths.secret.display().to_string(),
            "public": paths.public.display().to_string(),
            "fingerprint": fingerprint,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {} Generated Ed25519 keypair", style("*").green().bold());
    println!("  Secret:      {}", paths.secret.display());
    println!("  Public:      {}", paths.public.display());
    println!("  Fingerprint: {}", style(&fingerprint).cyan());
    println!();
    println!("  Enable signing in {}:", style(data_dir.join("config.toml").display()).dim());
    println!();
    println!("    [audit]");
    println!("    signing_key_path = \"{}\"", paths.secret.display());
    println!("    verify_key_path = \"{}\"", paths.public.display());
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_under_data_dir_by_default() {
        let dir = TempDir::new().unwrap();
        keygen(dir.path(), None, true).unwrap();
        assert!(dir.path().join("keys/audit.secret").exists());
        assert!(dir.path().join("keys/audit.pub").exists());
        // A second run must not clobber the existing key.
        assert!(keygen(dir.path(), None, true).is_err());
    }
}
