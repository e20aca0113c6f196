//! File-backed reference database backend (`ldbm database`).
//!
//! Each instance keeps its entries in one LDIF data file guarded by a blake3
//! checksum, plus JSON equality and VLV index files. Every maintenance
//! capability is implemented so each offline mode can run end to end.

pub mod archive;
pub mod index;
pub mod layout;
pub mod ldif;

use crate::plugin::{
    Archiver, BackendPlugin, Exporter, Importer, Reindexer, TaskResult, Upgrader, Verifier,
};
use crate::task::{
    ArchiveOptions, ExportOptions, ImportOptions, IndexTarget, ReindexOptions, UniqueIdStrategy,
    UpgradeDnFormatOptions, UpgradeOptions, VerifyOptions,
};
use crate::BackendError;
use dirsrv_config::normalize_dn;
use layout::{checksum_file, data_file, write_atomic, LdbmLayout, DB_FORMAT_VERSION};
use ldif::LdifRecord;
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const UNIQUE_ID_ATTR: &str = "nsUniqueId";
const DEFAULT_NAMESPACE: &str = "00000000-00000000-00000000-00000000";

pub struct LdbmPlugin {
    name: String,
    layout: LdbmLayout,
    protocol_version: u32,
    instances: Vec<String>,
}

impl LdbmPlugin {
    pub fn new(
        name: &str,
        db_dir: impl Into<PathBuf>,
        protocol_version: u32,
        instances: Vec<String>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            layout: LdbmLayout::new(db_dir),
            protocol_version,
            instances,
        }
    }

    pub fn layout(&self) -> &LdbmLayout {
        &self.layout
    }

    fn instance<'a>(&'a self, name: &str) -> Result<&'a str, BackendError> {
        self.instances
            .iter()
            .find(|i| i.eq_ignore_ascii_case(name))
            .map(String::as_str)
            .ok_or_else(|| BackendError::UnknownInstance(name.to_owned()))
    }

    /// Entries of an instance. A missing data file is an empty database.
    pub fn load(&self, instance: &str) -> Result<Vec<LdifRecord>, BackendError> {
        load_dir(&self.layout.instance_dir(instance))
    }

    fn store(&self, instance: &str, records: &[LdifRecord]) -> Result<(), BackendError> {
        self.layout.initialize_instance(instance)?;
        store_dir(&self.layout.instance_dir(instance), records)
    }

    fn check_integrity(&self, instance: &str) -> Result<(), BackendError> {
        verify_checksum(&self.layout.instance_dir(instance))
    }

    fn ensure_version(&self) -> Result<(), BackendError> {
        if self.layout.read_version()?.is_none() {
            self.layout.write_version(DB_FORMAT_VERSION)?;
        }
        Ok(())
    }
}

fn load_dir(instance_dir: &Path) -> Result<Vec<LdifRecord>, BackendError> {
    let path = data_file(instance_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    ldif::parse(&fs::read_to_string(path)?)
}

fn serialize(records: &[LdifRecord]) -> String {
    records.iter().map(|r| r.render(false)).collect()
}

fn store_dir(instance_dir: &Path, records: &[LdifRecord]) -> Result<(), BackendError> {
    let content = serialize(records);
    write_atomic(&data_file(instance_dir), content.as_bytes())?;
    let hash = blake3::hash(content.as_bytes()).to_hex().to_string();
    write_atomic(&checksum_file(instance_dir), hash.as_bytes())
}

/// Compare the data file against its stored checksum. Instances that were
/// never written have nothing to check.
fn verify_checksum(instance_dir: &Path) -> Result<(), BackendError> {
    let data = data_file(instance_dir);
    let sum = checksum_file(instance_dir);
    if !data.exists() {
        return Ok(());
    }
    if !sum.exists() {
        return Err(BackendError::IntegrityFailure {
            path: data.display().to_string(),
            expected: "checksum file".to_owned(),
            actual: "none".to_owned(),
        });
    }
    let expected = fs::read_to_string(&sum)?.trim().to_owned();
    let actual = blake3::hash(&fs::read(&data)?).to_hex().to_string();
    if expected != actual {
        return Err(BackendError::IntegrityFailure {
            path: data.display().to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Format 32 hex digits the way unique ids are written: four dash-separated
/// groups of eight.
fn format_unique_id(hash: &blake3::Hash) -> String {
    let hex = hash.to_hex();
    let hex = hex.as_str();
    format!(
        "{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..16],
        &hex[16..24],
        &hex[24..32]
    )
}

fn generate_unique_id(
    strategy: UniqueIdStrategy,
    namespace: Option<&str>,
    record: &LdifRecord,
    seq: usize,
) -> Option<String> {
    match strategy {
        UniqueIdStrategy::None => None,
        UniqueIdStrategy::NameBased => {
            let ns = namespace.unwrap_or(DEFAULT_NAMESPACE);
            let dn = record.normalized_dn().to_ascii_lowercase();
            Some(format_unique_id(&blake3::hash(
                format!("{ns}:{dn}").as_bytes(),
            )))
        }
        UniqueIdStrategy::TimeBased => {
            let now = chrono::Utc::now();
            let stamp = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp());
            Some(format_unique_id(&blake3::hash(
                format!("{stamp}:{seq}:{}", record.dn).as_bytes(),
            )))
        }
    }
}

fn read_input(path: &Path) -> Result<String, BackendError> {
    if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(fs::read_to_string(path)?)
    }
}

fn is_replication_state(attr: &str) -> bool {
    let lower = attr.to_ascii_lowercase();
    lower.starts_with("nsds50") || lower == "nscpentrywsi"
}

fn rebuild_indexes(
    instance_dir: &Path,
    records: &[LdifRecord],
    extra: &[String],
) -> Result<usize, BackendError> {
    let mut attrs: BTreeSet<String> = index::DEFAULT_INDEXES
        .iter()
        .map(|a| (*a).to_owned())
        .collect();
    attrs.extend(index::existing_attr_indexes(instance_dir)?);
    attrs.extend(extra.iter().map(|a| a.to_ascii_lowercase()));
    for attr in &attrs {
        index::write_target(instance_dir, records, &IndexTarget::Attribute(attr.clone()))?;
    }
    Ok(attrs.len())
}

impl BackendPlugin for LdbmPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    fn instances(&self) -> Vec<String> {
        self.instances.clone()
    }

    fn importer(&self) -> Option<&dyn Importer> {
        Some(self)
    }

    fn exporter(&self) -> Option<&dyn Exporter> {
        Some(self)
    }

    fn reindexer(&self) -> Option<&dyn Reindexer> {
        Some(self)
    }

    fn archiver(&self) -> Option<&dyn Archiver> {
        Some(self)
    }

    fn upgrader(&self) -> Option<&dyn Upgrader> {
        Some(self)
    }

    fn verifier(&self) -> Option<&dyn Verifier> {
        Some(self)
    }
}

impl Importer for LdbmPlugin {
    fn import(&self, instance: &str, opts: &ImportOptions) -> TaskResult {
        let instance = self.instance(instance)?;
        if opts.encrypt {
            debug!("import {instance}: no encrypted attributes configured");
        }
        if let Some(chunk) = opts.merge_chunk_size {
            debug!("import {instance}: merge chunk size {chunk} has no effect on this backend");
        }

        let mut records = Vec::new();
        for input in &opts.inputs {
            let parsed = ldif::parse(&read_input(input)?)?;
            debug!("read {} entries from {}", parsed.len(), input.display());
            records.extend(parsed);
        }

        let mut seen = BTreeSet::new();
        let mut skipped = 0usize;
        let mut kept = Vec::with_capacity(records.len());
        for (seq, mut record) in records.into_iter().enumerate() {
            if !ldif::in_scope(&record.dn, &opts.include, &opts.exclude) {
                skipped += 1;
                continue;
            }
            if !seen.insert(record.normalized_dn().to_ascii_lowercase()) {
                warn!("import {instance}: duplicate entry '{}' skipped", record.dn);
                skipped += 1;
                continue;
            }
            if !record.has_attr(UNIQUE_ID_ATTR) {
                if let Some(id) =
                    generate_unique_id(opts.unique_id, opts.namespace_id.as_deref(), &record, seq)
                {
                    record.push(UNIQUE_ID_ATTR, &id);
                }
            }
            kept.push(record);
        }

        self.store(instance, &kept)?;
        if opts.no_attr_indexes {
            debug!("import {instance}: attribute indexes not built");
        } else {
            rebuild_indexes(&self.layout.instance_dir(instance), &kept, &[])?;
        }
        self.ensure_version()?;
        info!(
            "import {instance}: {} entries imported, {skipped} skipped",
            kept.len()
        );
        Ok(())
    }
}

impl Exporter for LdbmPlugin {
    fn export(&self, instance: &str, opts: &ExportOptions) -> TaskResult {
        let instance = self.instance(instance)?;
        if !opts.id2entry_only {
            self.check_integrity(instance)?;
        }
        if opts.encrypt {
            debug!("export {instance}: no encrypted attributes configured");
        }
        if opts.server_running {
            debug!("export {instance}: server is running, reading committed data only");
        }

        let records = self.load(instance)?;
        let first_of_batch = !opts.append_mode || opts.append_first;
        let mut body = String::new();
        if first_of_batch && !opts.no_version {
            body.push_str("version: 1\n\n");
        }
        let mut count = 0usize;
        for (id, record) in records.iter().enumerate() {
            if !ldif::in_scope(&record.dn, &opts.include, &opts.exclude) {
                continue;
            }
            if opts.print_key {
                body.push_str(&format!("# entry-id: {}\n", id + 1));
            }
            body.push_str(&record.render_filtered(!opts.no_wrap, |attr| {
                (opts.dump_unique_id || !attr.eq_ignore_ascii_case(UNIQUE_ID_ATTR))
                    && (opts.replica || !is_replication_state(attr))
            }));
            count += 1;
        }

        match opts.output.as_deref() {
            None => io::stdout().lock().write_all(body.as_bytes())?,
            Some(p) if p == Path::new("-") => io::stdout().lock().write_all(body.as_bytes())?,
            Some(path) => {
                let mut file = if first_of_batch {
                    OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(true)
                        .open(path)?
                } else {
                    OpenOptions::new().create(true).append(true).open(path)?
                };
                file.write_all(body.as_bytes())?;
                file.sync_all()?;
            }
        }
        info!("export {instance}: {count} entries exported");
        Ok(())
    }
}

impl Reindexer for LdbmPlugin {
    fn reindex(&self, instance: &str, opts: &ReindexOptions) -> TaskResult {
        let instance = self.instance(instance)?;
        self.check_integrity(instance)?;
        let records = self.load(instance)?;
        let dir = self.layout.instance_dir(instance);
        for target in &opts.targets {
            let keys = index::write_target(&dir, &records, target)?;
            info!(
                "reindex {instance}: index '{}' rebuilt with {keys} keys",
                target.name()
            );
        }
        Ok(())
    }
}

impl Archiver for LdbmPlugin {
    fn backup(&self, opts: &ArchiveOptions) -> TaskResult {
        let dir = opts.archive_dir.as_deref().ok_or_else(|| BackendError::Failed {
            code: 1,
            reason: "no archive directory supplied".to_owned(),
        })?;
        archive::create_archive(&self.name, &self.layout, &self.instances, dir)?;
        Ok(())
    }

    fn restore(&self, opts: &ArchiveOptions) -> TaskResult {
        let dir = opts.archive_dir.as_deref().ok_or_else(|| BackendError::Failed {
            code: 1,
            reason: "no archive directory supplied".to_owned(),
        })?;
        let only = match opts.instance.as_deref() {
            Some(inst) => Some(self.instance(inst)?),
            None => None,
        };
        archive::restore_archive(&self.layout, dir, only)?;
        Ok(())
    }
}

impl Upgrader for LdbmPlugin {
    fn upgrade(&self, opts: &UpgradeOptions) -> TaskResult {
        let found = self.layout.read_version()?;
        if let Some(found) = found {
            if found > DB_FORMAT_VERSION {
                return Err(BackendError::VersionMismatch {
                    expected: DB_FORMAT_VERSION,
                    found,
                });
            }
            if found == DB_FORMAT_VERSION && !opts.force && !opts.dn2rdn {
                info!("database format is already version {DB_FORMAT_VERSION}, nothing to do");
                return Ok(());
            }
        }

        let archive_dir = opts.archive_dir.as_deref().ok_or_else(|| BackendError::Failed {
            code: 1,
            reason: "no backup directory supplied".to_owned(),
        })?;
        archive::create_archive(&self.name, &self.layout, &self.instances, archive_dir)?;

        for instance in &self.instances {
            let dir = self.layout.instance_dir(instance);
            if !dir.exists() {
                continue;
            }
            let records = load_dir(&dir)?;
            store_dir(&dir, &records)?;
            let extra = if opts.dn2rdn {
                vec!["entryrdn".to_owned()]
            } else {
                Vec::new()
            };
            let n = rebuild_indexes(&dir, &records, &extra)?;
            info!("upgrade {instance}: {} entries rewritten, {n} indexes rebuilt", records.len());
        }
        self.layout.write_version(DB_FORMAT_VERSION)?;
        Ok(())
    }

    fn upgrade_dn_format(&self, instance: &str, opts: &UpgradeDnFormatOptions) -> TaskResult {
        let instance = self.instance(instance)?;
        let dir = opts
            .instance_dir
            .clone()
            .unwrap_or_else(|| self.layout.instance_dir(instance));
        let mut records = load_dir(&dir)?;

        let mut changed = 0usize;
        for (idx, record) in records.iter_mut().enumerate() {
            let normalized =
                normalize_dn(&record.dn).map_err(|e| BackendError::InvalidLdif {
                    record: idx + 1,
                    reason: e.to_string(),
                })?;
            if normalized != record.dn {
                debug!("dn '{}' -> '{normalized}'", record.dn);
                record.dn = normalized;
                changed += 1;
            }
        }

        if opts.dry_run {
            info!("upgradednformat {instance}: {changed} DN(s) would be rewritten (dry run)");
            return Ok(());
        }
        if changed > 0 {
            store_dir(&dir, &records)?;
        }
        info!("upgradednformat {instance}: {changed} DN(s) rewritten");
        Ok(())
    }
}

fn verify_instance(instance_dir: &Path) -> Result<usize, BackendError> {
    verify_checksum(instance_dir)?;
    let records = load_dir(instance_dir)?;
    let dns: BTreeSet<String> = records
        .iter()
        .map(|r| r.normalized_dn().to_ascii_lowercase())
        .collect();
    for attr in index::existing_attr_indexes(instance_dir)? {
        let idx = index::read_attr_index(instance_dir, &attr)?;
        for dn in idx.values().flatten() {
            let norm = normalize_dn(dn).unwrap_or_else(|_| dn.clone());
            if !dns.contains(&norm.to_ascii_lowercase()) {
                return Err(BackendError::IntegrityFailure {
                    path: layout::index_file(instance_dir, &attr).display().to_string(),
                    expected: "reference to an existing entry".to_owned(),
                    actual: dn.clone(),
                });
            }
        }
    }
    Ok(records.len())
}

impl Verifier for LdbmPlugin {
    fn verify(&self, opts: &VerifyOptions) -> TaskResult {
        let layout = match &opts.db_dir {
            Some(dir) => LdbmLayout::new(dir),
            None => self.layout.clone(),
        };
        let targets: Vec<&str> = if opts.instances.is_empty() {
            self.instances.iter().map(String::as_str).collect()
        } else {
            opts.instances
                .iter()
                .map(|i| self.instance(i))
                .collect::<Result<_, _>>()?
        };

        let mut failed = 0usize;
        for instance in targets {
            match verify_instance(&layout.instance_dir(instance)) {
                Ok(n) => {
                    if opts.verbose {
                        info!("dbverify {instance}: {n} entries, all indexes consistent");
                    }
                }
                Err(e) => {
                    warn!("dbverify {instance}: {e}");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(BackendError::Failed {
                code: 1,
                reason: format!("{failed} instance(s) failed verification"),
            });
        }
        info!("dbverify: database is consistent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA: &str = "\
dn: dc=example,dc=com
objectClass: domain
dc: example

dn: ou=people,dc=example,dc=com
objectClass: organizationalUnit
ou: people

dn: uid=alice,ou=people,dc=example,dc=com
objectClass: person
cn: Alice
uid: alice
nsds50ruv: {replica 1} 0000

dn: o=other
objectClass: organization
o: other
";

    fn plugin(db: &Path) -> LdbmPlugin {
        LdbmPlugin::new(
            "ldbm database",
            db,
            2,
            vec!["userRoot".to_owned(), "other".to_owned()],
        )
    }

    fn import_sample(p: &LdbmPlugin, dir: &Path, opts: ImportOptions) {
        let input = dir.join("in.ldif");
        fs::write(&input, DATA).unwrap();
        p.import(
            "userRoot",
            &ImportOptions {
                inputs: vec![input],
                ..opts
            },
        )
        .unwrap();
    }

    #[test]
    fn import_filters_and_builds_indexes() {
        let db = tempfile::tempdir().unwrap();
        let p = plugin(db.path());
        import_sample(
            &p,
            db.path(),
            ImportOptions {
                include: vec!["dc=example,dc=com".to_owned()],
                ..ImportOptions::default()
            },
        );
        let records = p.load("userRoot").unwrap();
        assert_eq!(records.len(), 3);
        let inst = p.layout().instance_dir("userRoot");
        let cn = index::read_attr_index(&inst, "cn").unwrap();
        assert!(cn.contains_key("alice"));
        assert_eq!(p.layout().read_version().unwrap(), Some(DB_FORMAT_VERSION));
    }

    #[test]
    fn import_unknown_instance_fails() {
        let db = tempfile::tempdir().unwrap();
        let p = plugin(db.path());
        let err = p.import("nope", &ImportOptions::default()).unwrap_err();
        assert!(matches!(err, BackendError::UnknownInstance(_)));
    }

    #[test]
    fn deterministic_unique_ids_are_stable() {
        let db1 = tempfile::tempdir().unwrap();
        let db2 = tempfile::tempdir().unwrap();
        let opts = ImportOptions {
            unique_id: UniqueIdStrategy::NameBased,
            namespace_id: Some("ns".to_owned()),
            ..ImportOptions::default()
        };
        let p1 = plugin(db1.path());
        let p2 = plugin(db2.path());
        import_sample(&p1, db1.path(), opts.clone());
        import_sample(&p2, db2.path(), opts);
        let ids1: Vec<String> = p1
            .load("userRoot")
            .unwrap()
            .iter()
            .map(|r| r.values(UNIQUE_ID_ATTR).next().unwrap().to_owned())
            .collect();
        let ids2: Vec<String> = p2
            .load("userRoot")
            .unwrap()
            .iter()
            .map(|r| r.values(UNIQUE_ID_ATTR).next().unwrap().to_owned())
            .collect();
        assert_eq!(ids1, ids2);
        assert_eq!(ids1[0].len(), 35);
    }

    #[test]
    fn export_strips_replication_state_and_unique_ids() {
        let db = tempfile::tempdir().unwrap();
        let p = plugin(db.path());
        import_sample(
            &p,
            db.path(),
            ImportOptions {
                unique_id: UniqueIdStrategy::TimeBased,
                ..ImportOptions::default()
            },
        );
        let out = db.path().join("out.ldif");
        p.export(
            "userRoot",
            &ExportOptions {
                output: Some(out.clone()),
                dump_unique_id: false,
                print_key: false,
                ..ExportOptions::default()
            },
        )
        .unwrap();
        let text = fs::read_to_string(&out).unwrap();
        assert!(text.starts_with("version: 1\n"));
        assert!(!text.contains("nsds50ruv"));
        assert!(!text.contains(UNIQUE_ID_ATTR));
        assert_eq!(ldif::parse(&text).unwrap().len(), 4);
    }

    #[test]
    fn replica_export_keeps_state() {
        let db = tempfile::tempdir().unwrap();
        let p = plugin(db.path());
        import_sample(&p, db.path(), ImportOptions::default());
        let out = db.path().join("out.ldif");
        p.export(
            "userRoot",
            &ExportOptions {
                output: Some(out.clone()),
                replica: true,
                ..ExportOptions::default()
            },
        )
        .unwrap();
        let text = fs::read_to_string(&out).unwrap();
        assert!(text.contains("nsds50ruv"));
        assert!(text.contains("# entry-id: 1"));
    }

    #[test]
    fn append_mode_appends_after_first() {
        let db = tempfile::tempdir().unwrap();
        let p = plugin(db.path());
        import_sample(&p, db.path(), ImportOptions::default());
        let out = db.path().join("out.ldif");
        fs::write(&out, "stale\n").unwrap();
        let first = ExportOptions {
            output: Some(out.clone()),
            print_key: false,
            ..ExportOptions::default()
        };
        p.export("userRoot", &first).unwrap();
        p.export(
            "other",
            &ExportOptions {
                append_first: false,
                ..first
            },
        )
        .unwrap();
        let text = fs::read_to_string(&out).unwrap();
        assert!(!text.contains("stale"));
        assert_eq!(text.matches("version: 1").count(), 1);
    }

    #[test]
    fn export_detects_corruption() {
        let db = tempfile::tempdir().unwrap();
        let p = plugin(db.path());
        import_sample(&p, db.path(), ImportOptions::default());
        let data = data_file(&p.layout().instance_dir("userRoot"));
        fs::write(&data, "dn: o=tampered\n\n").unwrap();

        let opts = ExportOptions {
            output: Some(db.path().join("out.ldif")),
            ..ExportOptions::default()
        };
        assert!(matches!(
            p.export("userRoot", &opts),
            Err(BackendError::IntegrityFailure { .. })
        ));
        let id2entry_only = ExportOptions {
            id2entry_only: true,
            ..opts
        };
        assert!(p.export("userRoot", &id2entry_only).is_ok());
    }

    #[test]
    fn reindex_attribute_and_vlv() {
        let db = tempfile::tempdir().unwrap();
        let p = plugin(db.path());
        import_sample(&p, db.path(), ImportOptions::default());
        p.reindex(
            "userRoot",
            &ReindexOptions {
                targets: vec![
                    IndexTarget::Attribute("ou".to_owned()),
                    IndexTarget::Vlv("byDn".to_owned()),
                ],
            },
        )
        .unwrap();
        let inst = p.layout().instance_dir("userRoot");
        assert!(layout::index_file(&inst, "ou").exists());
        assert!(layout::vlv_file(&inst, "byDn").exists());
    }

    #[test]
    fn verify_reports_dangling_index() {
        let db = tempfile::tempdir().unwrap();
        let p = plugin(db.path());
        import_sample(&p, db.path(), ImportOptions::default());
        let verbose = VerifyOptions {
            verbose: true,
            ..VerifyOptions::default()
        };
        p.verify(&verbose).unwrap();

        let inst = p.layout().instance_dir("userRoot");
        let mut idx = index::AttrIndex::new();
        idx.insert("ghost".to_owned(), vec!["uid=ghost,dc=example,dc=com".to_owned()]);
        write_atomic(
            &layout::index_file(&inst, "cn"),
            &serde_json::to_vec(&idx).unwrap(),
        )
        .unwrap();
        let err = p.verify(&verbose).unwrap_err();
        assert_eq!(err.code(), 1);
    }

    #[test]
    fn upgrade_backs_up_and_stamps_version() {
        let db = tempfile::tempdir().unwrap();
        let bak = tempfile::tempdir().unwrap();
        let p = plugin(db.path());
        import_sample(&p, db.path(), ImportOptions::default());
        p.layout().write_version(1).unwrap();

        p.upgrade(&UpgradeOptions {
            archive_dir: Some(bak.path().to_path_buf()),
            force: false,
            dn2rdn: true,
        })
        .unwrap();
        assert_eq!(p.layout().read_version().unwrap(), Some(DB_FORMAT_VERSION));
        assert!(bak.path().join("manifest.json").exists());
        let inst = p.layout().instance_dir("userRoot");
        assert!(layout::index_file(&inst, "entryrdn").exists());
        p.verify(&VerifyOptions::default()).unwrap();
    }

    #[test]
    fn upgrade_refuses_newer_format() {
        let db = tempfile::tempdir().unwrap();
        let p = plugin(db.path());
        p.layout().write_version(DB_FORMAT_VERSION + 1).unwrap();
        let err = p.upgrade(&UpgradeOptions::default()).unwrap_err();
        assert!(matches!(err, BackendError::VersionMismatch { .. }));
    }

    #[test]
    fn upgrade_dn_format_dry_run_leaves_data() {
        let db = tempfile::tempdir().unwrap();
        let p = plugin(db.path());
        let inst = p.layout().instance_dir("userRoot");
        fs::create_dir_all(&inst).unwrap();
        let original = "dn: UID=Alice, OU=People, DC=example, DC=com\nuid: alice\n\n";
        fs::write(data_file(&inst), original).unwrap();

        p.upgrade_dn_format(
            "userRoot",
            &UpgradeDnFormatOptions {
                instance_dir: None,
                dry_run: true,
            },
        )
        .unwrap();
        assert_eq!(fs::read_to_string(data_file(&inst)).unwrap(), original);

        p.upgrade_dn_format("userRoot", &UpgradeDnFormatOptions::default())
            .unwrap();
        let records = p.load("userRoot").unwrap();
        assert_eq!(records[0].dn, "uid=Alice,ou=People,dc=example,dc=com");
    }
}
