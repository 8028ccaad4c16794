//! Tag router.
//!
//! The router is the single source of truth for who subscribes to what. It
//! maps each tag to the connection ids observing it and resolves the next
//! hops for a data frame.
//!
//! # Modes
//!
//! - **Open**: any name may register, several connections may share a name
//!   (scaled-out instances of one function).
//! - **Workflow**: only configured function names may register, and a name is
//!   held by at most one connection. A newer registration evicts the older
//!   one and reports it as an [`Eviction`] so the caller can close the stale
//!   connection with a duplicate-name error.
//!
//! # Targets
//!
//! A subscriber may declare a wanted target. A frame carrying a target is
//! delivered only to subscribers wanting exactly that target; a frame without
//! one is delivered to every subscriber of its tag.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use zipline_proto::{LbType, Tag};

use crate::{env::Environment, error::RouteError};

/// Registration policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RouterMode {
    /// Any name, no uniqueness
    #[default]
    Open,
    /// Only these function names, one connection per name
    Workflow(BTreeSet<String>),
}

/// A subscription request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    /// Connection id
    pub conn_id: String,
    /// Function name
    pub name: String,
    /// Tags to receive
    pub observe_data_tags: Vec<Tag>,
    /// Only receive frames targeted at this value
    pub wanted_target: Option<String>,
}

/// A connection that lost its name to a newer registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    /// Evicted connection
    pub conn_id: String,
    /// Contested name
    pub name: String,
}

impl Eviction {
    /// Error to report to the evicted connection.
    pub fn error(&self) -> RouteError {
        RouteError::DuplicateName { name: self.name.clone(), conn_id: self.conn_id.clone() }
    }
}

#[derive(Default)]
struct Tables {
    /// tag -> conn id -> wanted target
    routes: HashMap<Tag, BTreeMap<String, Option<String>>>,
    /// conn id -> registration
    registrations: HashMap<String, Registration>,
}

impl Tables {
    fn remove(&mut self, conn_id: &str) -> Option<Registration> {
        let reg = self.registrations.remove(conn_id)?;
        for tag in &reg.observe_data_tags {
            if let Some(subs) = self.routes.get_mut(tag) {
                subs.remove(conn_id);
                if subs.is_empty() {
                    self.routes.remove(tag);
                }
            }
        }
        Some(reg)
    }
}

/// Tag-keyed subscriber directory.
pub struct Router {
    mode: RouterMode,
    tables: RwLock<Tables>,
}

impl Router {
    /// Router with the given registration policy.
    pub fn new(mode: RouterMode) -> Self {
        Self { mode, tables: RwLock::new(Tables::default()) }
    }

    /// Registration policy.
    pub fn mode(&self) -> &RouterMode {
        &self.mode
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a function called `name` may register.
    pub fn check(&self, name: &str) -> Result<(), RouteError> {
        match &self.mode {
            RouterMode::Workflow(functions) if !functions.contains(name) => {
                Err(RouteError::UnknownFunction { name: name.to_string() })
            },
            _ => Ok(()),
        }
    }

    /// Subscribe `reg.conn_id` to each of its tags.
    ///
    /// A connection registering again replaces its previous subscription. In
    /// workflow mode the name must be configured, and any other connection
    /// holding the same name is removed from every tag and returned.
    pub fn add(&self, reg: Registration) -> Result<Option<Eviction>, RouteError> {
        self.check(&reg.name)?;

        let mut tables = self.write();
        tables.remove(&reg.conn_id);

        let mut eviction = None;
        if matches!(self.mode, RouterMode::Workflow(_)) {
            let holder = tables
                .registrations
                .values()
                .find(|r| r.name == reg.name)
                .map(|r| r.conn_id.clone());
            if let Some(conn_id) = holder {
                tables.remove(&conn_id);
                eviction = Some(Eviction { conn_id, name: reg.name.clone() });
            }
        }

        for tag in &reg.observe_data_tags {
            tables.routes.entry(*tag).or_default().insert(reg.conn_id.clone(), reg.wanted_target.clone());
        }
        tables.registrations.insert(reg.conn_id.clone(), reg);
        Ok(eviction)
    }

    /// Remove `conn_id` from every tag. Returns whether it was registered.
    pub fn remove(&self, conn_id: &str) -> bool {
        self.write().remove(conn_id).is_some()
    }

    /// Every current subscriber of `tag`, ignoring targets, in id order.
    pub fn forward_routes(&self, tag: Tag) -> Vec<String> {
        self.read().routes.get(&tag).map(|subs| subs.keys().cloned().collect()).unwrap_or_default()
    }

    /// Subscribers of `tag` that should receive a frame carrying `target`.
    pub fn route(&self, tag: Tag, target: Option<&str>) -> Vec<String> {
        let tables = self.read();
        let Some(subs) = tables.routes.get(&tag) else {
            return Vec::new();
        };
        match target {
            Some(target) => subs
                .iter()
                .filter(|(_, wanted)| wanted.as_deref() == Some(target))
                .map(|(id, _)| id.clone())
                .collect(),
            None => subs.keys().cloned().collect(),
        }
    }

    /// Registration of `conn_id`.
    pub fn registration(&self, conn_id: &str) -> Option<Registration> {
        self.read().registrations.get(conn_id).cloned()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.read().registrations.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.read().registrations.is_empty()
    }

    /// Drop all state.
    pub fn clean(&self) {
        let mut tables = self.write();
        tables.routes.clear();
        tables.registrations.clear();
    }
}

/// Narrow resolved subscribers according to a load-balance policy.
///
/// Routing misses are not errors: an empty result means nobody receives the
/// frame.
pub fn select_targets<E: Environment>(
    candidates: Vec<String>,
    policy: LbType,
    to_instance_id: &str,
    env: &E,
) -> Vec<String> {
    match policy {
        LbType::Broadcast => candidates,
        LbType::RandomPick => {
            if candidates.is_empty() {
                return candidates;
            }
            let pick = env.random_index(candidates.len());
            candidates.into_iter().nth(pick).into_iter().collect()
        },
        LbType::BindInstance => candidates.into_iter().filter(|id| id == to_instance_id).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::SystemEnv;

    fn reg(conn_id: &str, name: &str, tags: &[Tag]) -> Registration {
        Registration {
            conn_id: conn_id.into(),
            name: name.into(),
            observe_data_tags: tags.to_vec(),
            wanted_target: None,
        }
    }

    fn workflow(names: &[&str]) -> Router {
        Router::new(RouterMode::Workflow(names.iter().map(|n| (*n).to_string()).collect()))
    }

    #[test]
    fn fan_out_to_tag_subscribers() {
        let router = Router::new(RouterMode::Open);
        router.add(reg("A", "a", &[1])).unwrap();
        router.add(reg("B", "b", &[1])).unwrap();
        router.add(reg("C", "c", &[2])).unwrap();

        assert_eq!(router.route(1, None), ["A", "B"]);
        assert!(router.remove("A"));
        assert_eq!(router.route(1, None), ["B"]);
        assert_eq!(router.route(2, None), ["C"]);
        assert!(router.route(3, None).is_empty());
    }

    #[test]
    fn re_registration_replaces_tags() {
        let router = Router::new(RouterMode::Open);
        router.add(reg("A", "a", &[1, 2])).unwrap();
        router.add(reg("A", "a", &[3])).unwrap();

        assert!(router.forward_routes(1).is_empty());
        assert!(router.forward_routes(2).is_empty());
        assert_eq!(router.forward_routes(3), ["A"]);
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn open_mode_allows_shared_names() {
        let router = Router::new(RouterMode::Open);
        assert_eq!(router.add(reg("X", "sfn-1", &[1])), Ok(None));
        assert_eq!(router.add(reg("Y", "sfn-1", &[1])), Ok(None));
        assert_eq!(router.route(1, None), ["X", "Y"]);
    }

    #[test]
    fn workflow_rejects_unknown_function() {
        let router = workflow(&["sfn-1"]);
        assert_eq!(
            router.add(reg("X", "sfn-9", &[1])),
            Err(RouteError::UnknownFunction { name: "sfn-9".into() })
        );
        assert!(router.is_empty());
    }

    #[test]
    fn workflow_evicts_duplicate_name_from_every_tag() {
        let router = workflow(&["sfn-1"]);
        router.add(reg("X", "sfn-1", &[1, 2])).unwrap();

        let eviction = router.add(reg("Y", "sfn-1", &[1])).unwrap().unwrap();
        assert_eq!(eviction, Eviction { conn_id: "X".into(), name: "sfn-1".into() });
        assert_eq!(
            eviction.error(),
            RouteError::DuplicateName { name: "sfn-1".into(), conn_id: "X".into() }
        );

        assert_eq!(router.route(1, None), ["Y"]);
        assert!(router.route(2, None).is_empty());
        assert!(router.registration("X").is_none());
    }

    #[test]
    fn workflow_same_connection_re_registering_is_not_evicted() {
        let router = workflow(&["sfn-1"]);
        router.add(reg("X", "sfn-1", &[1])).unwrap();
        assert_eq!(router.add(reg("X", "sfn-1", &[2])), Ok(None));
        assert_eq!(router.route(2, None), ["X"]);
    }

    #[test]
    fn wanted_target_filters_targeted_frames() {
        let router = Router::new(RouterMode::Open);
        let mut one = reg("conn-1", "a", &[1]);
        one.wanted_target = Some("target-1".into());
        let mut two = reg("conn-2", "b", &[1]);
        two.wanted_target = Some("target-1".into());
        let mut three = reg("conn-3", "c", &[1]);
        three.wanted_target = Some("target-2".into());
        let plain = reg("conn-4", "d", &[1]);
        for r in [one, two, three, plain] {
            router.add(r).unwrap();
        }

        assert_eq!(router.route(1, Some("target-1")), ["conn-1", "conn-2"]);
        assert_eq!(router.route(1, Some("nobody")), Vec::<String>::new());
        assert_eq!(router.route(1, None), ["conn-1", "conn-2", "conn-3", "conn-4"]);
    }

    #[test]
    fn clean_drops_everything() {
        let router = Router::new(RouterMode::Open);
        router.add(reg("A", "a", &[1])).unwrap();
        router.clean();
        assert!(router.route(1, None).is_empty());
        assert!(router.is_empty());
    }

    #[test]
    fn lb_policies() {
        let candidates = || vec!["a".to_string(), "b".to_string(), "c".to_string()];

        assert_eq!(select_targets(candidates(), LbType::Broadcast, "", &SystemEnv), candidates());
        assert_eq!(select_targets(candidates(), LbType::BindInstance, "b", &SystemEnv), ["b"]);
        assert!(select_targets(candidates(), LbType::BindInstance, "z", &SystemEnv).is_empty());

        let picked = select_targets(candidates(), LbType::RandomPick, "", &SystemEnv);
        assert_eq!(picked.len(), 1);
        assert!(candidates().contains(&picked[0]));
        assert!(select_targets(Vec::new(), LbType::RandomPick, "", &SystemEnv).is_empty());
    }
}
