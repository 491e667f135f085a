//! Multi-shard migration coordinator
//!
//! [`ShardedMigrator`] wraps the host [`MigrationEngine`] and implements the
//! same trait. Each command is fanned out over the target shard set, one
//! pinned shard at a time, and the engine only sees the migration files that
//! declare the pinned shard.
//!
//! An unknown-version failure on one shard is tolerated when the version is
//! declared for another shard of the same run; any other failure halts the
//! fan-out.

use crate::error::{BoxError, MigrationError, Result, ShardError};
use crate::metrics::RouterMetrics;
use crate::proxy::{IntoShardNames, ShardProxy};
use crate::shard::{Connector, ShardContext, ShardRegistry, MASTER};

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Migration direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// Command passed to the migration engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationCommand {
    /// Migrate to `target`, or to the latest version
    Migrate { target: Option<String> },
    /// Apply pending migrations up to `target`
    Up { target: Option<String> },
    /// Revert migrations down to `target`
    Down { target: Option<String> },
    /// Run a single version in one direction
    Run { direction: Direction, target: String },
}

impl MigrationCommand {
    /// Static label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationCommand::Migrate { .. } => "migrate",
            MigrationCommand::Up { .. } => "up",
            MigrationCommand::Down { .. } => "down",
            MigrationCommand::Run { .. } => "run",
        }
    }

    /// Target version, if any
    pub fn target(&self) -> Option<&str> {
        match self {
            MigrationCommand::Migrate { target }
            | MigrationCommand::Up { target }
            | MigrationCommand::Down { target } => target.as_deref(),
            MigrationCommand::Run { target, .. } => Some(target),
        }
    }
}

/// Shard selection of a migration file or of a migration run
///
/// An explicit group wins over explicit shards; with neither, the registry's
/// default migration group applies, and then the master.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationTargets {
    shards: Vec<String>,
    groups: Vec<String>,
    group_specified: bool,
}

impl MigrationTargets {
    /// Selection that defers to the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Target explicit shard(s)
    pub fn using(mut self, shards: impl IntoShardNames) -> Self {
        self.shards = shards.into_shard_names();
        self
    }

    /// Target every member of the group(s)
    pub fn using_group(mut self, groups: impl IntoShardNames) -> Self {
        self.groups = groups.into_shard_names();
        self.group_specified = true;
        self
    }

    /// Selection currently held by a shard context
    pub fn from_context(ctx: &ShardContext) -> Self {
        Self {
            shards: ctx.current_shard().to_vec(),
            groups: ctx.current_group().to_vec(),
            group_specified: ctx.group_explicitly_set(),
        }
    }

    /// Resolve to a sorted shard list
    ///
    /// An explicit group without members resolves to nothing.
    pub fn resolve(&self, registry: &ShardRegistry) -> Vec<String> {
        if self.group_specified {
            return group_members(registry, &self.groups).into_iter().collect();
        }

        if !self.shards.is_empty() {
            let unique: BTreeSet<String> = self.shards.iter().cloned().collect();
            return unique.into_iter().collect();
        }

        let defaults = group_members(registry, registry.default_migration_group());
        if defaults.is_empty() {
            vec![MASTER.to_string()]
        } else {
            defaults.into_iter().collect()
        }
    }
}

fn group_members(registry: &ShardRegistry, groups: &[String]) -> BTreeSet<String> {
    let mut shards = BTreeSet::new();
    for group in groups {
        match registry.shards_for_group(group) {
            Some(members) => shards.extend(members.iter().cloned()),
            None => warn!(group = %group, "Ignoring undeclared migration group"),
        }
    }
    shards
}

/// One migration file as listed by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub version: String,
    pub name: String,
    pub targets: MigrationTargets,
}

impl MigrationFile {
    /// File with default targets
    pub fn new(version: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            name: name.into(),
            targets: MigrationTargets::new(),
        }
    }

    /// Declare the file's targets
    pub fn with_targets(mut self, targets: MigrationTargets) -> Self {
        self.targets = targets;
        self
    }

    /// Shards this file applies to
    pub fn declared_shards(&self, registry: &ShardRegistry) -> Vec<String> {
        self.targets.resolve(registry)
    }
}

/// Host migration machinery
pub trait MigrationEngine {
    /// Every migration file found under `paths`
    fn migrations(&self, paths: &[PathBuf]) -> std::result::Result<Vec<MigrationFile>, MigrationError>;

    /// Execute `command` on the current connection, considering only `available`
    fn execute(
        &self,
        command: &MigrationCommand,
        available: &[MigrationFile],
    ) -> std::result::Result<(), MigrationError>;
}

/// Outcome of one migration invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Shards the command ran on, in execution order
    pub shards: Vec<String>,
    /// Shard -> version that shard legitimately lacks
    pub skipped: BTreeMap<String, String>,
}

/// Migration engine decorator that fans commands out across shards
pub struct ShardedMigrator<E, K: Connector> {
    engine: E,
    proxy: Arc<ShardProxy<K>>,
    metrics: RouterMetrics,
}

impl<E: MigrationEngine, K: Connector> ShardedMigrator<E, K> {
    /// Wrap `engine`, routing through `proxy`
    pub fn new(engine: E, proxy: Arc<ShardProxy<K>>) -> Self {
        Self {
            engine,
            proxy,
            metrics: RouterMetrics::new(),
        }
    }

    /// Wrapped engine
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Routing proxy
    pub fn proxy(&self) -> &Arc<ShardProxy<K>> {
        &self.proxy
    }

    /// Migration files that declare the currently pinned shard
    pub fn migrations_for_current_shard(&self, paths: &[PathBuf]) -> Result<Vec<MigrationFile>> {
        let all = self.list(paths)?;
        if !self.proxy.is_sharded() {
            return Ok(all);
        }
        let shard = self.proxy.shard_name()?;
        Ok(self.available_on(&shard, &all))
    }

    /// Migrate every target shard to `target` (or the latest version)
    pub fn migrate(&self, paths: &[PathBuf], target: Option<&str>) -> Result<MigrationReport> {
        let command = MigrationCommand::Migrate {
            target: target.map(str::to_string),
        };
        self.dispatch(&command, paths)
    }

    /// Apply pending migrations up to `target`
    pub fn up(&self, paths: &[PathBuf], target: Option<&str>) -> Result<MigrationReport> {
        let command = MigrationCommand::Up {
            target: target.map(str::to_string),
        };
        self.dispatch(&command, paths)
    }

    /// Revert migrations down to `target`
    pub fn down(&self, paths: &[PathBuf], target: Option<&str>) -> Result<MigrationReport> {
        let command = MigrationCommand::Down {
            target: target.map(str::to_string),
        };
        self.dispatch(&command, paths)
    }

    /// Run the single migration `target` in `direction`
    pub fn run(&self, direction: Direction, paths: &[PathBuf], target: &str) -> Result<MigrationReport> {
        let command = MigrationCommand::Run {
            direction,
            target: target.to_string(),
        };
        self.dispatch(&command, paths)
    }

    fn dispatch(&self, command: &MigrationCommand, paths: &[PathBuf]) -> Result<MigrationReport> {
        let all = self.list(paths)?;
        self.apply(command, &all)
    }

    fn list(&self, paths: &[PathBuf]) -> Result<Vec<MigrationFile>> {
        self.engine
            .migrations(paths)
            .map_err(|e| self.engine_failure(MASTER, e))
    }

    /// Run `command` over the target shard set
    pub fn apply(&self, command: &MigrationCommand, all: &[MigrationFile]) -> Result<MigrationReport> {
        if !self.proxy.is_sharded() {
            self.engine
                .execute(command, all)
                .map_err(|e| self.engine_failure(MASTER, e))?;
            return Ok(MigrationReport {
                shards: vec![MASTER.to_string()],
                skipped: BTreeMap::new(),
            });
        }

        let ctx = self.proxy.context();
        // Only a shard selection pins; a group selection fans out over its members.
        let pinned = ctx.in_block() || ctx.head().is_some_and(|head| head != MASTER);

        if pinned && matches!(command, MigrationCommand::Up { .. } | MigrationCommand::Down { .. }) {
            let current = self.proxy.shard_name()?;
            debug!(shard = %current, command = command.as_str(), "Already pinned, running without fan-out");
            return self.run_pinned(command, all, current);
        }

        let targets = MigrationTargets::from_context(&ctx).resolve(self.proxy.registry());
        if targets.is_empty() {
            info!(command = command.as_str(), "Migration group has no shards, nothing to run");
            return Ok(MigrationReport::default());
        }

        let mut unknown: BTreeMap<String, String> = BTreeMap::new();
        let shards = self
            .proxy
            .send_queries_to_multiple_shards(targets.clone(), |shard| {
                self.run_on_shard(command, all, shard, &mut unknown)
                    .map(|()| shard.to_string())
            })?;

        self.reconcile(all, &targets, unknown, shards)
    }

    fn run_pinned(
        &self,
        command: &MigrationCommand,
        all: &[MigrationFile],
        shard: String,
    ) -> Result<MigrationReport> {
        let mut unknown = BTreeMap::new();
        self.run_on_shard(command, all, &shard, &mut unknown)?;
        self.reconcile(all, &[shard.clone()], unknown, vec![shard])
    }

    fn run_on_shard(
        &self,
        command: &MigrationCommand,
        all: &[MigrationFile],
        shard: &str,
        unknown: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let available = self.available_on(shard, all);
        info!(
            shard,
            command = command.as_str(),
            target = command.target().unwrap_or("latest"),
            migrations = available.len(),
            "Migrating - Shard: {shard}"
        );

        match self.engine.execute(command, &available) {
            Ok(()) => {
                self.metrics.record_migration(shard, "ok");
                Ok(())
            }
            Err(MigrationError::UnknownVersion { version }) => {
                debug!(shard, version = %version, "Version not available on shard");
                self.metrics.record_migration(shard, "unknown_version");
                unknown.insert(shard.to_string(), version);
                Ok(())
            }
            Err(MigrationError::Failed(source)) => {
                self.metrics.record_migration(shard, "failed");
                let err = ShardError::MigrationFailed {
                    shard: shard.to_string(),
                    source,
                };
                self.metrics.record_error(&err);
                Err(err)
            }
        }
    }

    /// Keep unknown versions declared for some target shard; re-raise the rest
    fn reconcile(
        &self,
        all: &[MigrationFile],
        targets: &[String],
        unknown: BTreeMap<String, String>,
        shards: Vec<String>,
    ) -> Result<MigrationReport> {
        let registry = self.proxy.registry();

        for (shard, version) in &unknown {
            let declared = all.iter().any(|file| {
                file.version == *version
                    && file
                        .declared_shards(registry)
                        .iter()
                        .any(|s| targets.contains(s))
            });

            if !declared {
                let err = ShardError::UnknownMigrationVersion {
                    version: version.clone(),
                    shard: shard.clone(),
                };
                self.metrics.record_error(&err);
                return Err(err);
            }
            info!(shard = %shard, version = %version, "Shard does not declare migration, skipped");
        }

        Ok(MigrationReport {
            shards,
            skipped: unknown,
        })
    }

    fn available_on(&self, shard: &str, all: &[MigrationFile]) -> Vec<MigrationFile> {
        let registry = self.proxy.registry();
        all.iter()
            .filter(|file| file.declared_shards(registry).iter().any(|s| s == shard))
            .cloned()
            .collect()
    }

    fn engine_failure(&self, shard: &str, err: MigrationError) -> ShardError {
        let err = match err {
            MigrationError::UnknownVersion { version } => ShardError::UnknownMigrationVersion {
                version,
                shard: shard.to_string(),
            },
            MigrationError::Failed(source) => ShardError::MigrationFailed {
                shard: shard.to_string(),
                source,
            },
        };
        self.metrics.record_error(&err);
        err
    }
}

impl<E: MigrationEngine, K: Connector> MigrationEngine for ShardedMigrator<E, K> {
    fn migrations(&self, paths: &[PathBuf]) -> std::result::Result<Vec<MigrationFile>, MigrationError> {
        self.migrations_for_current_shard(paths)
            .map_err(into_migration_error)
    }

    fn execute(
        &self,
        command: &MigrationCommand,
        available: &[MigrationFile],
    ) -> std::result::Result<(), MigrationError> {
        self.apply(command, available)
            .map(|_| ())
            .map_err(into_migration_error)
    }
}

fn into_migration_error(err: ShardError) -> MigrationError {
    match err {
        ShardError::UnknownMigrationVersion { version, .. } => MigrationError::UnknownVersion { version },
        other => MigrationError::Failed(BoxError::from(other)),
    }
}
