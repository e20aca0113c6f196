use super::layout::{index_dir, index_file, vlv_file, write_atomic};
use super::ldif::LdifRecord;
use crate::task::IndexTarget;
use crate::BackendError;
use dirsrv_config::dn::split_rdns;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Attributes indexed on every import unless `-O` was given.
pub const DEFAULT_INDEXES: &[&str] = &["objectclass", "cn", "uid", "entrydn"];

/// Equality index: lowercased value to the DNs carrying it.
pub type AttrIndex = BTreeMap<String, Vec<String>>;

fn index_values(record: &LdifRecord, attr: &str) -> Vec<String> {
    if attr.eq_ignore_ascii_case("entrydn") {
        return vec![record.normalized_dn().to_ascii_lowercase()];
    }
    if attr.eq_ignore_ascii_case("entryrdn") {
        let dn = record.normalized_dn().to_ascii_lowercase();
        return split_rdns(&dn)
            .first()
            .map(|rdn| vec![(*rdn).to_owned()])
            .unwrap_or_default();
    }
    record
        .values(attr)
        .map(|v| v.trim().to_ascii_lowercase())
        .collect()
}

pub fn build_attr_index(records: &[LdifRecord], attr: &str) -> AttrIndex {
    let mut index = AttrIndex::new();
    for record in records {
        for value in index_values(record, attr) {
            index.entry(value).or_default().push(record.dn.clone());
        }
    }
    index
}

/// A VLV index keeps the DNs of every entry in sorted order.
pub fn build_vlv_index(records: &[LdifRecord]) -> Vec<String> {
    let mut dns: Vec<String> = records.iter().map(LdifRecord::normalized_dn).collect();
    dns.sort_by_key(|d| d.to_ascii_lowercase());
    dns
}

pub fn write_target(
    instance_dir: &Path,
    records: &[LdifRecord],
    target: &IndexTarget,
) -> Result<usize, BackendError> {
    match target {
        IndexTarget::Attribute(attr) => {
            let index = build_attr_index(records, attr);
            let content = serde_json::to_vec_pretty(&index)?;
            write_atomic(&index_file(instance_dir, attr), &content)?;
            Ok(index.len())
        }
        IndexTarget::Vlv(name) => {
            let index = build_vlv_index(records);
            let content = serde_json::to_vec_pretty(&index)?;
            write_atomic(&vlv_file(instance_dir, name), &content)?;
            Ok(index.len())
        }
    }
}

/// Attribute indexes currently present for an instance.
pub fn existing_attr_indexes(instance_dir: &Path) -> Result<Vec<String>, BackendError> {
    let dir = index_dir(instance_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut attrs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "idx") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                attrs.push(stem.to_owned());
            }
        }
    }
    attrs.sort();
    Ok(attrs)
}

pub fn read_attr_index(instance_dir: &Path, attr: &str) -> Result<AttrIndex, BackendError> {
    let content = fs::read(index_file(instance_dir, attr))?;
    Ok(serde_json::from_slice(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<LdifRecord> {
        let mut a = LdifRecord::new("uid=alice,ou=people,dc=example,dc=com");
        a.push("objectClass", "person");
        a.push("cn", "Alice");
        let mut b = LdifRecord::new("uid=bob,ou=people,dc=example,dc=com");
        b.push("objectClass", "person");
        b.push("cn", "Bob");
        vec![a, b]
    }

    #[test]
    fn attr_index_groups_by_lowercased_value() {
        let index = build_attr_index(&records(), "objectclass");
        assert_eq!(index["person"].len(), 2);
        let cn = build_attr_index(&records(), "cn");
        assert_eq!(cn["alice"], vec!["uid=alice,ou=people,dc=example,dc=com"]);
    }

    #[test]
    fn entrydn_index_uses_the_dn() {
        let index = build_attr_index(&records(), "entrydn");
        assert!(index.contains_key("uid=bob,ou=people,dc=example,dc=com"));
    }

    #[test]
    fn entryrdn_index_uses_leftmost_rdn() {
        let index = build_attr_index(&records(), "entryrdn");
        assert_eq!(index["uid=alice"], vec!["uid=alice,ou=people,dc=example,dc=com"]);
    }

    #[test]
    fn write_and_list_indexes() {
        let dir = tempfile::tempdir().unwrap();
        write_target(dir.path(), &records(), &IndexTarget::Attribute("CN".to_owned())).unwrap();
        write_target(dir.path(), &records(), &IndexTarget::Vlv("byName".to_owned())).unwrap();
        assert_eq!(existing_attr_indexes(dir.path()).unwrap(), vec!["cn"]);
        assert_eq!(read_attr_index(dir.path(), "cn").unwrap().len(), 2);
    }
}
