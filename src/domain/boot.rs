//! Boot and shutdown order
//!
//! Groups form a DAG through their declared dependencies. The boot order is
//! a stable topological sort: declaration order decides between groups whose
//! dependencies are equally satisfied. Shutdown walks the same batches in
//! reverse.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::configuration::Model;
use crate::domain_types::Alias;
use crate::error::{CasualError, Result};

use super::state::{BatchTask, TaskKind};

/// Deadline for one boot batch to come online
pub const BOOT_BATCH_DEADLINE: Duration = Duration::from_secs(10);

/// Grace period before a cooperative shutdown turns into termination
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Name of the implicit group holding the core managers
pub const MASTER_GROUP: &str = ".master";

/// Name of the implicit group for servers without memberships
pub const DEFAULT_GROUP: &str = ".default";

/// Stable topological order of the configured group names
///
/// # Errors
///
/// Returns a configuration error when the dependencies contain a cycle.
pub fn group_order(model: &Model) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for group in &model.groups {
        in_degree.entry(group.name.as_str()).or_insert(0);
        for dependency in &group.dependencies {
            *in_degree.entry(group.name.as_str()).or_insert(0) += 1;
            dependents
                .entry(dependency.as_str())
                .or_default()
                .push(group.name.as_str());
        }
    }

    // stable: seed the queue in declaration order
    let mut ready: VecDeque<&str> = model
        .groups
        .iter()
        .map(|group| group.name.as_str())
        .filter(|name| in_degree.get(name).copied().unwrap_or(0) == 0)
        .collect();

    let mut order = Vec::with_capacity(model.groups.len());
    while let Some(name) = ready.pop_front() {
        order.push(name.to_string());
        for dependent in dependents.get(name).map(Vec::as_slice).unwrap_or(&[]) {
            let degree = in_degree
                .get_mut(dependent)
                .unwrap_or_else(|| unreachable!("every dependent has a degree"));
            *degree -= 1;
            if *degree == 0 {
                // preserve declaration order among newly ready groups
                let position = model
                    .groups
                    .iter()
                    .position(|group| group.name == *dependent)
                    .unwrap_or(usize::MAX);
                let insert_at = ready
                    .iter()
                    .position(|queued| {
                        model
                            .groups
                            .iter()
                            .position(|group| group.name == *queued)
                            .unwrap_or(usize::MAX)
                            > position
                    })
                    .unwrap_or(ready.len());
                ready.insert(insert_at, dependent);
            }
        }
    }

    if order.len() != model.groups.len() {
        return Err(CasualError::Configuration {
            field: "groups".into(),
            reason: "dependency cycle".into(),
        });
    }
    Ok(order)
}

/// Builds boot batches: the core managers one by one (each publishes
/// handles the next depends on), then user groups in topological order,
/// then servers without memberships
///
/// # Errors
///
/// Propagates cycle detection from [`group_order`].
pub fn boot_batches(model: &Model, managers: Vec<Alias>) -> Result<Vec<BatchTask>> {
    let mut batches = Vec::new();

    for manager in managers {
        batches.push(BatchTask {
            kind: TaskKind::Boot,
            group: format!("{MASTER_GROUP}/{manager}"),
            aliases: vec![manager],
            deadline: None,
            started: false,
        });
    }

    let mut assigned: HashSet<&Alias> = HashSet::new();
    for group in group_order(model)? {
        let aliases: Vec<Alias> = model
            .servers
            .iter()
            .filter(|server| server.memberships.contains(&group))
            .map(|server| server.alias.clone())
            .collect();
        for server in model
            .servers
            .iter()
            .filter(|server| server.memberships.contains(&group))
        {
            assigned.insert(&server.alias);
        }
        if !aliases.is_empty() {
            batches.push(BatchTask {
                kind: TaskKind::Boot,
                group,
                aliases,
                deadline: None,
                started: false,
            });
        }
    }

    let unassigned: Vec<Alias> = model
        .servers
        .iter()
        .filter(|server| !assigned.contains(&server.alias))
        .map(|server| server.alias.clone())
        .collect();
    if !unassigned.is_empty() {
        batches.push(BatchTask {
            kind: TaskKind::Boot,
            group: DEFAULT_GROUP.to_string(),
            aliases: unassigned,
            deadline: None,
            started: false,
        });
    }

    Ok(batches)
}

/// Shutdown batches: the boot batches reversed
pub fn shutdown_batches(boot: &[BatchTask]) -> Vec<BatchTask> {
    boot.iter()
        .rev()
        .map(|batch| BatchTask {
            kind: TaskKind::Shutdown,
            group: batch.group.clone(),
            aliases: batch.aliases.clone(),
            deadline: None,
            started: false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{Group, Server};

    fn model_with_groups(groups: Vec<Group>) -> Model {
        let mut model = Model::named("boot-order");
        model.groups = groups;
        model
    }

    #[test]
    fn declaration_order_is_stable_without_dependencies() {
        let model = model_with_groups(vec![
            Group {
                name: "b".into(),
                dependencies: vec![],
            },
            Group {
                name: "a".into(),
                dependencies: vec![],
            },
        ]);
        assert_eq!(group_order(&model).expect("acyclic"), vec!["b", "a"]);
    }

    #[test]
    fn dependencies_come_first() {
        let model = model_with_groups(vec![
            Group {
                name: "app".into(),
                dependencies: vec!["base".into()],
            },
            Group {
                name: "base".into(),
                dependencies: vec![],
            },
        ]);
        assert_eq!(group_order(&model).expect("acyclic"), vec!["base", "app"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let model = model_with_groups(vec![
            Group {
                name: "a".into(),
                dependencies: vec!["b".into()],
            },
            Group {
                name: "b".into(),
                dependencies: vec!["a".into()],
            },
        ]);
        assert!(group_order(&model).is_err());
    }

    #[test]
    fn servers_without_membership_boot_last() {
        let mut model = model_with_groups(vec![Group {
            name: "base".into(),
            dependencies: vec![],
        }]);
        model.servers = vec![
            Server {
                alias: Alias::try_new("late").expect("valid alias"),
                instances: 1,
                memberships: vec![],
                restart: false,
            },
            Server {
                alias: Alias::try_new("early").expect("valid alias"),
                instances: 1,
                memberships: vec!["base".into()],
                restart: false,
            },
        ];

        let managers = vec![Alias::try_new("casual-service-manager").expect("valid alias")];
        let batches = boot_batches(&model, managers).expect("acyclic");
        let groups: Vec<&str> = batches.iter().map(|batch| batch.group.as_str()).collect();
        assert_eq!(
            groups,
            vec![".master/casual-service-manager", "base", DEFAULT_GROUP]
        );
        assert_eq!(
            batches[2].aliases,
            vec![Alias::try_new("late").expect("valid alias")]
        );
    }

    #[test]
    fn shutdown_is_reverse_boot() {
        let mut model = model_with_groups(vec![Group {
            name: "base".into(),
            dependencies: vec![],
        }]);
        model.servers = vec![Server {
            alias: Alias::try_new("server-a").expect("valid alias"),
            instances: 1,
            memberships: vec!["base".into()],
            restart: false,
        }];
        let managers = vec![Alias::try_new("casual-service-manager").expect("valid alias")];
        let boot = boot_batches(&model, managers).expect("acyclic");
        let shutdown = shutdown_batches(&boot);
        assert_eq!(shutdown.first().map(|batch| batch.group.as_str()), Some("base"));
        assert_eq!(
            shutdown.last().map(|batch| batch.group.as_str()),
            Some(".master/casual-service-manager")
        );
    }
}
