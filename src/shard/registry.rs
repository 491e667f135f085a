//! Shard registry
//!
//! Turns the parsed shards configuration into named connection specs, the
//! group lookup and the optional replication topology. Construction is
//! all-or-nothing: any configuration error discards the partial registry.

use crate::config::{ConnectionConfig, ShardEntry, ShardsConfig};
use crate::error::{Result, ShardError};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};

/// Name of the implicit default shard
pub const MASTER: &str = "master";

/// Replication role of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// Immutable connection specification for one shard
#[derive(Debug, Clone, PartialEq)]
pub struct ShardSpec {
    pub name: String,
    pub config: ConnectionConfig,
    pub groups: BTreeSet<String>,
    pub role: Role,
}

impl ShardSpec {
    /// Engine kind backing this shard
    pub fn adapter(&self) -> &str {
        &self.config.adapter
    }
}

/// Master/slave layout of a replicated environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationTopology {
    pub master: String,
    pub slaves: Vec<String>,
}

/// Registry of every shard known to the router
#[derive(Debug, Clone)]
pub struct ShardRegistry {
    shards: BTreeMap<String, ShardSpec>,
    groups: BTreeMap<String, BTreeSet<String>>,
    replication: Option<ReplicationTopology>,
    default_migration_group: Vec<String>,
    verify_connection: bool,
    sharded: bool,
}

impl ShardRegistry {
    /// Registry holding only the implicit `master` shard (non-sharded mode)
    pub fn single(master: ConnectionConfig) -> Self {
        let spec = ShardSpec {
            name: MASTER.to_string(),
            config: master,
            groups: BTreeSet::new(),
            role: Role::Master,
        };

        Self {
            shards: BTreeMap::from([(MASTER.to_string(), spec)]),
            groups: BTreeMap::new(),
            replication: None,
            default_migration_group: Vec::new(),
            verify_connection: false,
            sharded: false,
        }
    }

    /// Build the registry for `app_env`
    ///
    /// Falls back to [`ShardRegistry::single`] when there is no configuration,
    /// when `app_env` is not listed in `environments`, or when no shards are
    /// declared for it.
    pub fn build(
        config: Option<&ShardsConfig>,
        app_env: &str,
        master: ConnectionConfig,
    ) -> Result<Self> {
        let Some(config) = config else {
            info!("No shards configuration, running with master only");
            return Ok(Self::single(master));
        };

        if !config.enabled_for(app_env) {
            info!(app_env, "Sharding not enabled for environment, running with master only");
            return Ok(Self::single(master));
        }

        let Some(entries) = config.shards_for(app_env) else {
            info!(app_env, "No shards declared for environment, running with master only");
            return Ok(Self::single(master));
        };

        let mut builder = RegistryBuilder::new(master)
            .verify_connection(config.verify_connection)
            .default_migration_group(config.default_migration_group.iter().cloned());

        for (name, entry) in entries {
            builder = match entry {
                ShardEntry::Shard(conn) => builder.shard(name, conn.clone()),
                ShardEntry::Group(members) => members.iter().fold(builder, |b, (shard, conn)| {
                    b.group_shard(name, shard, conn.clone())
                }),
            };
        }

        for (group, members) in &config.groups {
            builder = builder.group(group, members.iter().cloned());
        }

        if config.replicated {
            builder = builder.replicated(config.slaves.clone());
        }

        builder.build()
    }

    /// Whether more than the implicit master is configured
    pub fn is_sharded(&self) -> bool {
        self.sharded
    }

    /// Every shard name, sorted
    pub fn shard_names(&self) -> Vec<String> {
        self.shards.keys().cloned().collect()
    }

    /// Members of `group`, or `None` for an undeclared group
    pub fn shards_for_group(&self, group: &str) -> Option<&BTreeSet<String>> {
        self.groups.get(group)
    }

    /// Whether `group` is declared
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    /// Every group name, sorted
    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// Spec for `name`, if registered
    pub fn spec_for(&self, name: &str) -> Option<&ShardSpec> {
        self.shards.get(name)
    }

    /// Spec for `name`, failing with `UnknownShard`
    pub fn require(&self, name: &str) -> Result<&ShardSpec> {
        self.spec_for(name).ok_or_else(|| ShardError::UnknownShard {
            name: name.to_string(),
        })
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.shards.contains_key(name)
    }

    /// Distinct adapter kinds across all shards
    pub fn adapters(&self) -> BTreeSet<String> {
        self.shards.values().map(|s| s.config.adapter.clone()).collect()
    }

    /// Replication layout, present only in replicated environments
    pub fn replication(&self) -> Option<&ReplicationTopology> {
        self.replication.as_ref()
    }

    /// Groups migrations target when nothing is selected explicitly
    pub fn default_migration_group(&self) -> &[String] {
        &self.default_migration_group
    }

    /// Whether cached connections are verified before use
    pub fn verify_connection(&self) -> bool {
        self.verify_connection
    }

    /// Number of registered shards (master included)
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Always false: the master shard is always registered
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

/// Incremental registry construction
///
/// Entries are validated in declaration order by [`RegistryBuilder::build`];
/// the first duplicate or dangling reference aborts the whole build.
#[derive(Debug)]
pub struct RegistryBuilder {
    master: ConnectionConfig,
    entries: Vec<(String, ConnectionConfig, Option<String>)>,
    memberships: Vec<(String, Vec<String>)>,
    replication: Option<Option<Vec<String>>>,
    default_migration_group: Vec<String>,
    verify_connection: bool,
}

impl RegistryBuilder {
    /// Start a registry whose implicit master uses `master`
    pub fn new(master: ConnectionConfig) -> Self {
        Self {
            master,
            entries: Vec::new(),
            memberships: Vec::new(),
            replication: None,
            default_migration_group: Vec::new(),
            verify_connection: false,
        }
    }

    /// Declare a shard outside any group
    pub fn shard(mut self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.entries.push((name.into(), config, None));
        self
    }

    /// Declare a shard nested under `group`
    pub fn group_shard(
        mut self,
        group: impl Into<String>,
        name: impl Into<String>,
        config: ConnectionConfig,
    ) -> Self {
        self.entries.push((name.into(), config, Some(group.into())));
        self
    }

    /// Add already-declared shards to `group`
    pub fn group<I, S>(mut self, group: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.memberships
            .push((group.into(), members.into_iter().map(Into::into).collect()));
        self
    }

    /// Enable replication; `None` makes every non-master shard a slave
    pub fn replicated(mut self, slaves: Option<Vec<String>>) -> Self {
        self.replication = Some(slaves);
        self
    }

    /// Set the default migration group(s)
    pub fn default_migration_group<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_migration_group = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Verify cached connections before use
    pub fn verify_connection(mut self, verify: bool) -> Self {
        self.verify_connection = verify;
        self
    }

    /// Validate every entry and produce the registry
    pub fn build(self) -> Result<ShardRegistry> {
        let mut seen: HashSet<String> = HashSet::from([MASTER.to_string()]);
        let mut shards = BTreeMap::new();
        let mut groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        shards.insert(
            MASTER.to_string(),
            ShardSpec {
                name: MASTER.to_string(),
                config: self.master,
                groups: BTreeSet::new(),
                role: Role::Master,
            },
        );

        for (name, config, group) in self.entries {
            if !seen.insert(name.clone()) {
                return Err(ShardError::DuplicateShardName { name });
            }

            let mut memberships = BTreeSet::new();
            if let Some(group) = group {
                groups.entry(group.clone()).or_default().insert(name.clone());
                memberships.insert(group);
            }

            debug!(shard = %name, adapter = %config.adapter, "Registering shard");

            shards.insert(
                name.clone(),
                ShardSpec {
                    name,
                    config,
                    groups: memberships,
                    role: Role::Master,
                },
            );
        }

        for (group, members) in self.memberships {
            let set = groups.entry(group.clone()).or_default();
            for shard in members {
                let Some(spec) = shards.get_mut(&shard) else {
                    return Err(ShardError::InvalidGroupMember { group, shard });
                };
                spec.groups.insert(group.clone());
                set.insert(shard);
            }
        }

        let replication = match self.replication {
            None => None,
            Some(slaves) => {
                let slaves = match slaves {
                    Some(list) => list,
                    None => shards.keys().filter(|n| *n != MASTER).cloned().collect(),
                };
                if slaves.is_empty() {
                    return Err(ShardError::Config(
                        "replicated environment declares no slaves".to_string(),
                    ));
                }
                for slave in &slaves {
                    match shards.get_mut(slave) {
                        Some(spec) if slave != MASTER => spec.role = Role::Slave,
                        Some(_) => {
                            return Err(ShardError::Config(
                                "master cannot be listed as a slave".to_string(),
                            ))
                        }
                        None => {
                            return Err(ShardError::Config(format!(
                                "slave list references undeclared shard '{slave}'"
                            )))
                        }
                    }
                }
                Some(ReplicationTopology {
                    master: MASTER.to_string(),
                    slaves,
                })
            }
        };

        info!(
            shards = shards.len(),
            groups = groups.len(),
            replicated = replication.is_some(),
            "Shard registry built"
        );

        Ok(ShardRegistry {
            shards,
            groups,
            replication,
            default_migration_group: self.default_migration_group,
            verify_connection: self.verify_connection,
            sharded: true,
        })
    }
}
