//! Migration fan-out integration tests
//!
//! Drives `ShardedMigrator` with an in-memory engine that applies versions
//! through the routing proxy, the way a host ORM would.

use shard_router::{
    BoxError, ConnectionConfig, Connector, Direction, MigrationCommand, MigrationEngine,
    MigrationError, MigrationFile, MigrationTargets, OperationKind, RegistryBuilder, ShardError,
    ShardProxy, ShardRegistry, ShardSpec, ShardedMigrator, MASTER,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const CREATE_USERS: &str = "20230101_create_users";

struct NameConnector;

impl Connector for NameConnector {
    type Connection = String;

    fn connect(&self, spec: &ShardSpec) -> Result<String, BoxError> {
        Ok(spec.name.clone())
    }
}

/// Keeps a schema_migrations set per shard
struct MemoryEngine {
    proxy: Arc<ShardProxy<NameConnector>>,
    files: Vec<MigrationFile>,
    applied: Mutex<Vec<(String, String)>>,
    broken_shard: Option<String>,
}

impl MemoryEngine {
    fn new(proxy: Arc<ShardProxy<NameConnector>>, files: Vec<MigrationFile>) -> Self {
        Self {
            proxy,
            files,
            applied: Mutex::new(Vec::new()),
            broken_shard: None,
        }
    }

    fn applied_on(&self, shard: &str) -> BTreeSet<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == shard)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn apply(&self, version: &str) -> Result<(), MigrationError> {
        let shard = self
            .proxy
            .execute(OperationKind::Write, |conn| Ok::<_, ShardError>(conn.clone()))
            .map_err(|e| MigrationError::Failed(e.into()))?;

        if self.broken_shard.as_deref() == Some(shard.as_str()) {
            return Err(MigrationError::Failed(format!("{shard} is read-only").into()));
        }
        self.applied.lock().unwrap().push((shard, version.to_string()));
        Ok(())
    }
}

impl MigrationEngine for MemoryEngine {
    fn migrations(&self, _paths: &[PathBuf]) -> Result<Vec<MigrationFile>, MigrationError> {
        Ok(self.files.clone())
    }

    fn execute(
        &self,
        command: &MigrationCommand,
        available: &[MigrationFile],
    ) -> Result<(), MigrationError> {
        if let Some(target) = command.target() {
            if !available.iter().any(|f| f.version == target) {
                return Err(MigrationError::UnknownVersion {
                    version: target.to_string(),
                });
            }
        }

        match command {
            MigrationCommand::Run { target, .. } => self.apply(target),
            _ => available.iter().try_for_each(|f| self.apply(&f.version)),
        }
    }
}

fn registry() -> ShardRegistry {
    let mysql = ConnectionConfig::new("mysql2");
    RegistryBuilder::new(mysql.clone())
        .group_shard("country_shards", "canada", mysql.clone())
        .group_shard("country_shards", "brazil", mysql.clone())
        .group_shard("country_shards", "russia", mysql.clone())
        .group("empty_group", Vec::<String>::new())
        .default_migration_group(["country_shards"])
        .build()
        .unwrap()
}

fn users_files() -> Vec<MigrationFile> {
    vec![
        MigrationFile::new(CREATE_USERS, "create_users_canada")
            .with_targets(MigrationTargets::new().using("canada")),
        MigrationFile::new(CREATE_USERS, "create_users_brazil")
            .with_targets(MigrationTargets::new().using("brazil")),
    ]
}

fn migrator(
    files: Vec<MigrationFile>,
    broken_shard: Option<&str>,
) -> ShardedMigrator<MemoryEngine, NameConnector> {
    let proxy = Arc::new(ShardProxy::new(registry(), NameConnector));
    let mut engine = MemoryEngine::new(Arc::clone(&proxy), files);
    engine.broken_shard = broken_shard.map(str::to_string);
    ShardedMigrator::new(engine, proxy)
}

#[test]
fn version_split_across_files_runs_on_each_shard() -> anyhow::Result<()> {
    let migrator = migrator(users_files(), None);
    migrator.proxy().using(["canada", "brazil"])?;

    let report = migrator.run(Direction::Up, &[], CREATE_USERS)?;
    migrator.proxy().reset();

    assert_eq!(report.shards, vec!["brazil", "canada"]);
    assert!(report.skipped.is_empty());
    assert!(migrator.engine().applied_on("canada").contains(CREATE_USERS));
    assert!(migrator.engine().applied_on("brazil").contains(CREATE_USERS));
    Ok(())
}

#[test]
fn version_declared_nowhere_in_target_set_is_raised() {
    let migrator = migrator(users_files(), None);
    migrator.proxy().using("russia").unwrap();

    let err = migrator.run(Direction::Up, &[], CREATE_USERS).unwrap_err();
    migrator.proxy().reset();

    match err {
        ShardError::UnknownMigrationVersion { version, shard } => {
            assert_eq!(version, CREATE_USERS);
            assert_eq!(shard, "russia");
        }
        other => panic!("expected unknown version, got {other:?}"),
    }
    assert!(migrator.engine().applied_on("russia").is_empty());
}

#[test]
fn shard_lacking_a_declared_version_is_skipped() {
    let migrator = migrator(users_files(), None);
    migrator.proxy().using(["canada", "russia"]).unwrap();

    let report = migrator.run(Direction::Up, &[], CREATE_USERS).unwrap();
    migrator.proxy().reset();

    assert_eq!(report.shards, vec!["canada", "russia"]);
    assert_eq!(
        report.skipped.get("russia").map(String::as_str),
        Some(CREATE_USERS)
    );
    assert!(migrator.engine().applied_on("canada").contains(CREATE_USERS));
}

#[test]
fn default_migration_group_is_used_without_selection() {
    let files = vec![MigrationFile::new("1", "add_index")
        .with_targets(MigrationTargets::new().using_group("country_shards"))];
    let migrator = migrator(files, None);

    let report = migrator.migrate(&[], None).unwrap();

    assert_eq!(report.shards, vec!["brazil", "canada", "russia"]);
    for shard in ["brazil", "canada", "russia"] {
        assert!(migrator.engine().applied_on(shard).contains("1"));
    }
    assert!(migrator.engine().applied_on(MASTER).is_empty());
}

#[test]
fn explicit_empty_group_is_a_noop() {
    let migrator = migrator(users_files(), None);
    migrator.proxy().using_group("empty_group").unwrap();

    let report = migrator.migrate(&[], None).unwrap();
    migrator.proxy().reset();

    assert!(report.shards.is_empty());
    assert!(migrator.engine().applied.lock().unwrap().is_empty());
}

#[test]
fn engine_failure_halts_fan_out_and_names_shard() {
    let files = vec![MigrationFile::new("1", "add_index")
        .with_targets(MigrationTargets::new().using_group("country_shards"))];
    let migrator = migrator(files, Some("canada"));

    let err = migrator.up(&[], None).unwrap_err();

    assert!(matches!(err, ShardError::MigrationFailed { ref shard, .. } if shard == "canada"));
    assert!(migrator.engine().applied_on("brazil").contains("1"));
    assert!(migrator.engine().applied_on("russia").is_empty());
    assert_eq!(migrator.proxy().shard_name().unwrap(), MASTER);
}

#[test]
fn down_from_pinned_shard_stays_on_that_shard() {
    let files = vec![MigrationFile::new("1", "add_index")
        .with_targets(MigrationTargets::new().using_group("country_shards"))];
    let migrator = migrator(files, None);

    let report = migrator
        .proxy()
        .with_shard("brazil", || migrator.down(&[], Some("1")))
        .unwrap()
        .unwrap();

    assert_eq!(report.shards, vec!["brazil"]);
    assert_eq!(migrator.engine().applied.lock().unwrap().len(), 1);
}

#[test]
fn group_selection_fans_up_and_down_out_over_members() {
    let files = vec![MigrationFile::new("1", "add_index")
        .with_targets(MigrationTargets::new().using_group("country_shards"))];
    let migrator = migrator(files, None);
    migrator.proxy().using_group("country_shards").unwrap();

    let up = migrator.up(&[], None).unwrap();
    assert_eq!(up.shards, vec!["brazil", "canada", "russia"]);
    for shard in ["brazil", "canada", "russia"] {
        assert!(migrator.engine().applied_on(shard).contains("1"));
    }

    let down = migrator.down(&[], Some("1")).unwrap();
    migrator.proxy().reset();
    assert_eq!(down.shards, vec!["brazil", "canada", "russia"]);
    assert_eq!(migrator.engine().applied.lock().unwrap().len(), 6);
}

#[test]
fn decorator_is_itself_a_migration_engine() {
    let migrator = migrator(users_files(), None);

    let listed = migrator
        .proxy()
        .with_shard("canada", || MigrationEngine::migrations(&migrator, &[]))
        .unwrap()
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "create_users_canada");

    migrator.proxy().using("russia").unwrap();
    let command = MigrationCommand::Run {
        direction: Direction::Up,
        target: CREATE_USERS.to_string(),
    };
    let err = MigrationEngine::execute(&migrator, &command, &users_files()).unwrap_err();
    migrator.proxy().reset();
    assert!(matches!(err, MigrationError::UnknownVersion { ref version } if version == CREATE_USERS));
}

#[test]
fn unsharded_proxy_runs_once_on_master() {
    let proxy = Arc::new(ShardProxy::new(
        ShardRegistry::single(ConnectionConfig::new("sqlite3")),
        NameConnector,
    ));
    let files = vec![MigrationFile::new("1", "create_users")];
    let migrator = ShardedMigrator::new(MemoryEngine::new(Arc::clone(&proxy), files), proxy);

    let report = migrator.migrate(&[], None).unwrap();
    assert_eq!(report.shards, vec![MASTER]);
    assert!(migrator.engine().applied_on(MASTER).contains("1"));
}
