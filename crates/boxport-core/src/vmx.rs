//! VMX and machine-readable key/value parsing.
//!
//! VMware `.vmx` files and `VBoxManage showvminfo --machinereadable` output
//! share one line format: `key = "value"` or `key="value"`.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// The parts of a VMX file the exporter reads.
#[derive(Debug, Clone)]
pub struct VmxConfig {
    /// The display name of the VM.
    pub display_name: String,
    /// Raw key-value pairs from the VMX file.
    pub raw: HashMap<String, String>,
}

impl VmxConfig {
    /// Look up a raw key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw.get(key).map(String::as_str)
    }
}

/// Parse a VMX file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or has no `displayName`.
pub fn parse_vmx(path: &Path) -> Result<VmxConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::io(e, path))?;
    parse_vmx_content(&content)
}

/// Parse VMX content from a string.
pub fn parse_vmx_content(content: &str) -> Result<VmxConfig> {
    let raw = parse_key_values(content);

    let display_name = raw
        .get("displayName")
        .cloned()
        .ok_or_else(|| Error::vmx_parse("missing displayName"))?;

    Ok(VmxConfig {
        display_name,
        raw,
    })
}

/// Parse `key = value` lines into a map.
///
/// Handles both quoted and unquoted values:
/// - `key = "value"` -> ("key", "value")
/// - `key=value` -> ("key", "value")
///
/// Keys may themselves be quoted, as `VBoxManage` does for some entries.
pub fn parse_key_values(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(eq_pos) = line.find('=') {
            let key = unquote(line[..eq_pos].trim());
            let value = unquote(line[eq_pos + 1..].trim());
            map.insert(key.to_string(), value.to_string());
        }
    }

    map
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_values_quoted() {
        let content = r#"
            displayName = "My VM"
            memsize = "2048"
        "#;
        let map = parse_key_values(content);
        assert_eq!(map.get("displayName"), Some(&"My VM".to_string()));
        assert_eq!(map.get("memsize"), Some(&"2048".to_string()));
    }

    #[test]
    fn test_parse_key_values_machinereadable() {
        let content = "name=\"dev\"\nVMState=\"running\"\nmacaddress1=\"080027AABBCC\"\n\"storage\"=\"x\"\n";
        let map = parse_key_values(content);
        assert_eq!(map.get("VMState").map(String::as_str), Some("running"));
        assert_eq!(map.get("macaddress1").map(String::as_str), Some("080027AABBCC"));
        assert_eq!(map.get("storage").map(String::as_str), Some("x"));
    }

    #[test]
    fn test_parse_key_values_skips_comments_and_blanks() {
        let content = "# comment\n\ndisplayName = \"Test\"\n";
        let map = parse_key_values(content);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_parse_vmx_content() {
        let content = r#"
            displayName = "TestVM"
            ethernet0.generatedAddress = "00:0c:29:aa:bb:cc"
        "#;
        let config = parse_vmx_content(content).unwrap();
        assert_eq!(config.display_name, "TestVM");
        assert_eq!(config.get("ethernet0.generatedAddress"), Some("00:0c:29:aa:bb:cc"));
        assert_eq!(config.get("displayName"), Some("TestVM"));
    }

    #[test]
    fn test_parse_vmx_content_requires_display_name() {
        let err = parse_vmx_content("memsize = \"1024\"").unwrap_err();
        assert!(err.to_string().contains("displayName"));
    }
}
