//! Box assembly: metadata, template files and configuration fragments.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::extract::has_extension;
use crate::machine::{Machine, ProviderKind, VIRTUALBOX_PROVIDER};
use crate::workspace::{copy_relative, list_files};

/// Box metadata file name.
pub const METADATA_FILE: &str = "metadata.json";

/// Configuration fragment file shipped inside the box.
pub const VAGRANTFILE: &str = "Vagrantfile";

/// Name the machine's generated private key is packaged under.
pub const PACKAGED_KEY_FILE: &str = "vagrant_private_key";

/// Template files with these extensions are never merged into a box.
pub const TEMPLATE_EXCLUDED_EXTENSIONS: &[&str] = &[
    "box", "gz", "tgz", "tar", "zip", "lock", "lck", "log", "vmdk", "vdi", "vhd", "vhdx",
    "nvram", "vmem", "vmsd", "vmss", "vmtm", "vmx", "vmxf", "scoreboard", "ovf", "mf",
];

static BASE_MAC_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Safety: this is a compile-time constant pattern, so it cannot fail.
    #[allow(clippy::expect_used)]
    Regex::new(r#"(?i)base_mac\s*=\s*["']"#).expect("valid regex")
});

/// Populate staging with everything besides the provider artifacts.
pub fn assemble(
    machine: &dyn Machine,
    staging: &Path,
    kind: ProviderKind,
    bare: bool,
) -> Result<()> {
    let provider = kind.normalize(machine.provider());
    write_metadata(staging, provider)?;

    if !bare {
        match machine.box_dir() {
            Some(dir) if dir.is_dir() => merge_template(dir, staging)?,
            Some(dir) => debug!(dir = %dir.display(), "box template directory missing, skipping"),
            None => debug!("machine has no box template directory"),
        }
    }

    if let Some(data_dir) = machine.data_dir() {
        inject_private_key(data_dir, staging)?;
    }

    if machine.provider() == VIRTUALBOX_PROVIDER {
        inject_base_mac(machine, staging)?;
    }
    Ok(())
}

/// Serialized metadata for `provider`, e.g. `{"provider":"virtualbox"}`.
pub fn metadata_json(provider: &str) -> String {
    serde_json::json!({ "provider": provider }).to_string()
}

/// Write `metadata.json` into the staging root.
pub fn write_metadata(staging: &Path, provider: &str) -> Result<()> {
    let path = staging.join(METADATA_FILE);
    fs::write(&path, metadata_json(provider)).map_err(|e| Error::io(e, &path))?;
    debug!(provider, "wrote metadata");
    Ok(())
}

/// Copy template files that are neither excluded by extension nor already
/// present in staging.
pub fn merge_template(template_dir: &Path, staging: &Path) -> Result<()> {
    let mut merged = 0usize;
    for file in list_files(template_dir)? {
        if has_extension(&file, TEMPLATE_EXCLUDED_EXTENSIONS) {
            continue;
        }
        if staging.join(&file).exists() {
            debug!(file = %file.display(), "staging already has file, keeping it");
            continue;
        }
        copy_relative(template_dir, staging, &file)?;
        merged += 1;
    }
    info!(merged, "merged box template files");
    Ok(())
}

/// Package the machine's generated key and point the box at it.
///
/// Does nothing when the machine never had a key generated.
pub fn inject_private_key(data_dir: &Path, staging: &Path) -> Result<()> {
    let key = data_dir.join("private_key");
    if !key.is_file() {
        debug!(key = %key.display(), "no generated private key");
        return Ok(());
    }

    let target = staging.join(PACKAGED_KEY_FILE);
    fs::copy(&key, &target).map_err(|e| Error::io(e, &key))?;
    append_config_block(
        staging,
        &[format!(
            "config.ssh.private_key_path = File.expand_path(\"../{}\", __FILE__)",
            PACKAGED_KEY_FILE
        )],
    )
}

/// Pin the VirtualBox MAC address in the box configuration unless it is
/// already set.
pub fn inject_base_mac(machine: &dyn Machine, staging: &Path) -> Result<()> {
    let vagrantfile = staging.join(VAGRANTFILE);
    if has_base_mac(&vagrantfile)? {
        debug!("configuration already sets base_mac");
        return Ok(());
    }

    match machine.read_mac_address()? {
        Some(mac) => append_config_block(staging, &[format!("config.vm.base_mac = \"{}\"", mac)]),
        None => {
            warn!("provider reported no MAC address, box will get a new one on import");
            Ok(())
        }
    }
}

/// Whether the configuration file at `path` assigns `base_mac`.
pub fn has_base_mac(path: &Path) -> Result<bool> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::io(e, path)),
    };
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::io(e, path))?;
        if BASE_MAC_RE.is_match(&line) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Append a configuration block holding `lines` to the staged Vagrantfile,
/// creating the file if needed. Existing content is never rewritten.
pub fn append_config_block(staging: &Path, lines: &[String]) -> Result<()> {
    let path = staging.join(VAGRANTFILE);
    let mut block = String::from("\nVagrant.configure(\"2\") do |config|\n");
    for line in lines {
        block.push_str("  ");
        block.push_str(line);
        block.push('\n');
    }
    block.push_str("end\n");

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| Error::io(e, &path))?;
    file.write_all(block.as_bytes())
        .map_err(|e| Error::io(e, &path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metadata_json_is_minimal() {
        assert_eq!(metadata_json("virtualbox"), r#"{"provider":"virtualbox"}"#);
        assert_eq!(metadata_json("vmware_desktop"), r#"{"provider":"vmware_desktop"}"#);
    }

    #[test]
    fn test_append_config_block_appends() {
        let staging = TempDir::new().unwrap();
        fs::write(staging.path().join(VAGRANTFILE), "# original\n").unwrap();

        append_config_block(staging.path(), &["config.vm.base_mac = \"0800271F2A33\"".into()])
            .unwrap();
        let content = fs::read_to_string(staging.path().join(VAGRANTFILE)).unwrap();
        assert!(content.starts_with("# original\n"));
        assert!(content.contains("Vagrant.configure(\"2\") do |config|\n"));
        assert!(content.contains("  config.vm.base_mac = \"0800271F2A33\"\n"));
        assert!(content.ends_with("end\n"));
    }

    #[test]
    fn test_has_base_mac() {
        let staging = TempDir::new().unwrap();
        let path = staging.path().join(VAGRANTFILE);
        assert!(!has_base_mac(&path).unwrap());

        fs::write(&path, "config.vm.box = \"x\"\n").unwrap();
        assert!(!has_base_mac(&path).unwrap());

        fs::write(&path, "  config.vm.BASE_MAC = '080027AABBCC'\n").unwrap();
        assert!(has_base_mac(&path).unwrap());
    }

    #[test]
    fn test_inject_private_key_without_key_is_noop() {
        let data = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        inject_private_key(data.path(), staging.path()).unwrap();
        assert!(!staging.path().join(PACKAGED_KEY_FILE).exists());
        assert!(!staging.path().join(VAGRANTFILE).exists());
    }
}
