//! Identity resolution: groups the aliases (email, user id, device id, ...)
//! of one real-world customer under a single canonical key.
//!
//! The graph behaves like a union-find over canonical keys. Resolving an
//! alias set that touches several existing keys unions them under one
//! survivor, which is always the lexicographically smallest key. Retired
//! keys forward to the survivor, and forwarding is kept one level deep, so
//! the final partition never depends on the order merges arrive in.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use customer_core::{Alias, CdpError, CdpResult, ErasureParticipant};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

// ─── Types ──────────────────────────────────────────────────────────────

/// All known aliases of one customer and the profiles linked to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityGroup {
    pub key: String,
    pub aliases: BTreeSet<Alias>,
    pub profiles: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of resolving an alias set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub key: String,
    /// A new canonical key was derived for a previously unknown alias set.
    pub created: bool,
    /// Keys retired by this call. They now forward to `key`.
    pub merged_keys: Vec<String>,
    /// Profiles whose group was merged away and must be re-pointed.
    pub repointed_profiles: BTreeSet<String>,
}

/// Result of a lock-aware resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveAttempt {
    Resolved(Resolution),
    /// The merge would re-point profiles the caller does not hold. Nothing
    /// was changed; retry while holding every listed profile.
    NeedsLocks(BTreeSet<String>),
}

#[derive(Default)]
struct GraphState {
    groups: HashMap<String, IdentityGroup>,
    alias_index: HashMap<Alias, String>,
    profile_index: HashMap<String, String>,
    /// Retired key -> live survivor.
    forwards: HashMap<String, String>,
}

// ─── Identity Graph ─────────────────────────────────────────────────────

/// Identity graph for a single service instance.
///
/// One mutex covers the whole graph: a merge must be atomic with respect to
/// any concurrent resolution that shares one of the merging aliases.
#[derive(Default)]
pub struct IdentityGraph {
    state: Mutex<GraphState>,
}

impl IdentityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an alias set to its canonical key, creating or merging groups
    /// as needed. Links no profile.
    pub fn resolve_or_create(&self, aliases: &[Alias]) -> CdpResult<Resolution> {
        let aliases = normalize(aliases)?;
        let mut state = self.state.lock();
        state.apply(&aliases, None, Utc::now())
    }

    /// Resolve an alias set and link `profile_id`, if given, to the resulting
    /// key, but only if every profile a merge would re-point is in `locked`.
    ///
    /// The check and the mutation happen under the same graph lock, so no
    /// concurrent resolution can slip a new profile into a merging group in
    /// between.
    pub fn try_resolve(
        &self,
        aliases: &[Alias],
        profile_id: Option<&str>,
        locked: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> CdpResult<ResolveAttempt> {
        let aliases = normalize(aliases)?;
        let mut state = self.state.lock();

        let touched = state.touched_keys(&aliases, profile_id);
        let required = state.merge_affected(&touched, profile_id);
        if !required.is_subset(locked) {
            debug!(
                profile_id,
                required = required.len(),
                "identity merge needs additional profile locks"
            );
            return Ok(ResolveAttempt::NeedsLocks(required));
        }

        state
            .apply(&aliases, profile_id, now)
            .map(ResolveAttempt::Resolved)
    }

    /// Profiles whose canonical key would change if `aliases` were resolved
    /// for `profile_id` right now, plus `profile_id` itself.
    pub fn affected_profiles(
        &self,
        aliases: &[Alias],
        profile_id: Option<&str>,
    ) -> BTreeSet<String> {
        let aliases: Vec<Alias> = aliases.iter().cloned().map(Alias::normalized).collect();
        let state = self.state.lock();
        let touched = state.touched_keys(&aliases, profile_id);
        state.merge_affected(&touched, profile_id)
    }

    /// Every profile linked to any group the aliases touch.
    pub fn linked_profiles(&self, aliases: &[Alias]) -> BTreeSet<String> {
        let aliases: Vec<Alias> = aliases.iter().cloned().map(Alias::normalized).collect();
        let state = self.state.lock();
        state
            .touched_keys(&aliases, None)
            .iter()
            .filter_map(|key| state.groups.get(key))
            .flat_map(|group| group.profiles.iter().cloned())
            .collect()
    }

    /// Follow forwarding to the live canonical key.
    pub fn find(&self, key: &str) -> Option<String> {
        self.state.lock().find(key)
    }

    pub fn lookup(&self, alias: &Alias) -> Option<String> {
        let alias = alias.clone().normalized();
        self.state.lock().alias_index.get(&alias).cloned()
    }

    pub fn group(&self, key: &str) -> Option<IdentityGroup> {
        let state = self.state.lock();
        let live = state.find(key)?;
        state.groups.get(&live).cloned()
    }

    pub fn aliases_of(&self, key: &str) -> Option<BTreeSet<Alias>> {
        self.group(key).map(|g| g.aliases)
    }

    pub fn key_for_profile(&self, profile_id: &str) -> Option<String> {
        self.state.lock().profile_index.get(profile_id).cloned()
    }

    /// Link a profile to a live group without touching aliases.
    pub fn link_profile(&self, key: &str, profile_id: &str) -> CdpResult<String> {
        let mut state = self.state.lock();
        let live = state
            .find(key)
            .ok_or_else(|| CdpError::not_found("canonical key", key))?;
        if let Some(existing) = state.profile_index.get(profile_id) {
            if existing != &live {
                return Err(CdpError::invalid(
                    "profile_id",
                    format!("{profile_id} is already linked to {existing}"),
                ));
            }
        }
        state.profile_index.insert(profile_id.to_string(), live.clone());
        if let Some(group) = state.groups.get_mut(&live) {
            group.profiles.insert(profile_id.to_string());
        }
        Ok(live)
    }

    /// Remove a profile link, keeping the group and its aliases.
    pub fn unlink_profile(&self, profile_id: &str) -> Option<String> {
        let mut state = self.state.lock();
        let key = state.profile_index.remove(profile_id)?;
        if let Some(group) = state.groups.get_mut(&key) {
            group.profiles.remove(profile_id);
        }
        Some(key)
    }

    /// Current alias partition, sorted, for comparing graph states.
    pub fn partition(&self) -> Vec<BTreeSet<Alias>> {
        let state = self.state.lock();
        let mut sets: Vec<BTreeSet<Alias>> =
            state.groups.values().map(|g| g.aliases.clone()).collect();
        sets.sort();
        sets
    }

    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    pub fn alias_count(&self) -> usize {
        self.state.lock().alias_index.len()
    }

    /// Verify every index agrees with the groups.
    pub fn check_consistency(&self) -> CdpResult<()> {
        self.state.lock().check()
    }
}

impl ErasureParticipant for IdentityGraph {
    fn component(&self) -> &'static str {
        "identity_graph"
    }

    fn holds(&self, customer_id: &str) -> bool {
        self.state.lock().profile_index.contains_key(customer_id)
    }

    /// Unlink the profile. A group left without profiles is dropped along
    /// with its aliases and any keys forwarding to it.
    fn erase(&self, customer_id: &str) {
        let mut state = self.state.lock();
        let Some(key) = state.profile_index.remove(customer_id) else {
            return;
        };
        let orphaned = match state.groups.get_mut(&key) {
            Some(group) => {
                group.profiles.remove(customer_id);
                group.profiles.is_empty()
            }
            None => false,
        };
        if orphaned {
            if let Some(group) = state.groups.remove(&key) {
                for alias in &group.aliases {
                    state.alias_index.remove(alias);
                }
                info!(
                    canonical_key = %key,
                    aliases = group.aliases.len(),
                    "identity group erased"
                );
            }
            state.forwards.retain(|_, target| target != &key);
        }
    }
}

// ─── Graph State ────────────────────────────────────────────────────────

impl GraphState {
    fn find(&self, key: &str) -> Option<String> {
        if self.groups.contains_key(key) {
            return Some(key.to_string());
        }
        self.forwards
            .get(key)
            .filter(|target| self.groups.contains_key(target.as_str()))
            .cloned()
    }

    fn touched_keys(&self, aliases: &[Alias], profile_id: Option<&str>) -> BTreeSet<String> {
        aliases
            .iter()
            .filter_map(|alias| self.alias_index.get(alias).cloned())
            .chain(profile_id.and_then(|id| self.profile_index.get(id).cloned()))
            .collect()
    }

    /// Profiles a resolution touching `touched` would re-point. Only a merge
    /// re-points anyone; the resolving profile is always included.
    fn merge_affected(
        &self,
        touched: &BTreeSet<String>,
        profile_id: Option<&str>,
    ) -> BTreeSet<String> {
        let mut affected: BTreeSet<String> = profile_id.map(str::to_string).into_iter().collect();
        if touched.len() > 1 {
            for key in touched {
                if let Some(group) = self.groups.get(key) {
                    affected.extend(group.profiles.iter().cloned());
                }
            }
        }
        affected
    }

    fn apply(
        &mut self,
        aliases: &[Alias],
        profile_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> CdpResult<Resolution> {
        let touched = self.touched_keys(aliases, profile_id);

        let mut resolution = match touched.len() {
            0 => {
                let key = derive_canonical_key(aliases)?;
                if self.groups.contains_key(&key) || self.forwards.contains_key(&key) {
                    return Err(CdpError::ConsistencyViolation(format!(
                        "derived canonical key {key} already exists for unknown aliases"
                    )));
                }
                self.groups.insert(
                    key.clone(),
                    IdentityGroup {
                        key: key.clone(),
                        aliases: BTreeSet::new(),
                        profiles: BTreeSet::new(),
                        created_at: now,
                        updated_at: now,
                    },
                );
                info!(canonical_key = %key, aliases = aliases.len(), "identity group created");
                Resolution {
                    key,
                    created: true,
                    merged_keys: Vec::new(),
                    repointed_profiles: BTreeSet::new(),
                }
            }
            _ => {
                let mut keys = touched.into_iter();
                let survivor = keys.next().unwrap_or_default();
                let losers: Vec<String> = keys.collect();
                let repointed = self.merge_into(&survivor, &losers)?;
                if !losers.is_empty() {
                    info!(
                        survivor = %survivor,
                        merged = losers.len(),
                        repointed = repointed.len(),
                        "identity groups merged"
                    );
                }
                Resolution {
                    key: survivor,
                    created: false,
                    merged_keys: losers,
                    repointed_profiles: repointed,
                }
            }
        };

        let key = resolution.key.clone();
        for alias in aliases {
            let owner = self.alias_index.get(alias).cloned();
            match owner {
                Some(owner) if owner != key => {
                    return Err(CdpError::ConsistencyViolation(format!(
                        "alias {alias} owned by {owner} while resolving into {key}"
                    )));
                }
                Some(_) => {}
                None => {
                    self.alias_index.insert(alias.clone(), key.clone());
                }
            }
        }

        let group = self.groups.get_mut(&key).ok_or_else(|| {
            CdpError::ConsistencyViolation(format!("canonical key {key} has no group"))
        })?;
        group.aliases.extend(aliases.iter().cloned());
        group.updated_at = now;
        if let Some(profile_id) = profile_id {
            group.profiles.insert(profile_id.to_string());
            self.profile_index.insert(profile_id.to_string(), key.clone());
            // The resolving profile is written by the caller directly.
            resolution.repointed_profiles.remove(profile_id);
        }

        Ok(resolution)
    }

    /// Union every loser group into `survivor`. Aliases and profile links
    /// are moved, never dropped.
    fn merge_into(&mut self, survivor: &str, losers: &[String]) -> CdpResult<BTreeSet<String>> {
        let mut repointed = BTreeSet::new();
        for loser in losers {
            let group = self.groups.remove(loser).ok_or_else(|| {
                CdpError::ConsistencyViolation(format!(
                    "canonical key {loser} is indexed but has no group"
                ))
            })?;
            for alias in &group.aliases {
                self.alias_index.insert(alias.clone(), survivor.to_string());
            }
            for profile in &group.profiles {
                self.profile_index.insert(profile.clone(), survivor.to_string());
                repointed.insert(profile.clone());
            }

            let target = self.groups.get_mut(survivor).ok_or_else(|| {
                CdpError::ConsistencyViolation(format!("canonical key {survivor} has no group"))
            })?;
            target.aliases.extend(group.aliases);
            target.profiles.extend(group.profiles);
            target.created_at = target.created_at.min(group.created_at);

            self.forwards.insert(loser.clone(), survivor.to_string());
        }

        // Keep forwarding flat.
        for target in self.forwards.values_mut() {
            if losers.contains(target) {
                *target = survivor.to_string();
            }
        }
        Ok(repointed)
    }

    fn check(&self) -> CdpResult<()> {
        for (alias, key) in &self.alias_index {
            let owned = self
                .groups
                .get(key)
                .is_some_and(|group| group.aliases.contains(alias));
            if !owned {
                return Err(CdpError::ConsistencyViolation(format!(
                    "alias {alias} indexed to {key} but not in its group"
                )));
            }
        }
        for (key, group) in &self.groups {
            for alias in &group.aliases {
                if self.alias_index.get(alias) != Some(key) {
                    return Err(CdpError::ConsistencyViolation(format!(
                        "alias {alias} in group {key} is indexed elsewhere"
                    )));
                }
            }
            for profile in &group.profiles {
                if self.profile_index.get(profile) != Some(key) {
                    return Err(CdpError::ConsistencyViolation(format!(
                        "profile {profile} in group {key} is indexed elsewhere"
                    )));
                }
            }
        }
        for (retired, target) in &self.forwards {
            if !self.groups.contains_key(target) {
                return Err(CdpError::ConsistencyViolation(format!(
                    "retired key {retired} forwards to missing key {target}"
                )));
            }
        }
        Ok(())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn normalize(aliases: &[Alias]) -> CdpResult<Vec<Alias>> {
    if aliases.is_empty() {
        return Err(CdpError::invalid("aliases", "at least one alias is required"));
    }
    let mut normalized: Vec<Alias> = Vec::with_capacity(aliases.len());
    for alias in aliases {
        let alias = alias.clone().normalized();
        if alias.value.is_empty() {
            return Err(CdpError::invalid(
                "aliases",
                format!("empty {} identifier", alias.namespace.as_str()),
            ));
        }
        if !normalized.contains(&alias) {
            normalized.push(alias);
        }
    }
    Ok(normalized)
}

/// SHA-256 of the primary identifier. The primary is the smallest alias in
/// namespace preference order, so emails win over user ids over devices.
pub fn derive_canonical_key(aliases: &[Alias]) -> CdpResult<String> {
    let primary = aliases
        .iter()
        .min()
        .ok_or_else(|| CdpError::invalid("aliases", "at least one alias is required"))?;
    let digest = Sha256::digest(primary.to_string().as_bytes());
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(set: &BTreeSet<Alias>) -> BTreeSet<&str> {
        set.iter().map(|a| a.value.as_str()).collect()
    }

    #[test]
    fn test_empty_alias_set_is_rejected() {
        let graph = IdentityGraph::new();
        let err = graph.resolve_or_create(&[]).unwrap_err();
        assert!(matches!(err, CdpError::InvalidArgument { ref field, .. } if field == "aliases"));
        assert_eq!(graph.group_count(), 0);
    }

    #[test]
    fn test_new_key_is_deterministic() {
        let first = IdentityGraph::new()
            .resolve_or_create(&[Alias::email("A@X.com"), Alias::user_id("u1")])
            .unwrap();
        let second = IdentityGraph::new()
            .resolve_or_create(&[Alias::user_id("u1"), Alias::email("a@x.com")])
            .unwrap();

        assert!(first.created);
        assert_eq!(first.key, second.key);
        assert_eq!(first.key, derive_canonical_key(&[Alias::email("a@x.com")]).unwrap());
        assert_eq!(first.key.len(), 64);
    }

    #[test]
    fn test_sequential_merges_union_aliases() {
        let graph = IdentityGraph::new();
        let first = graph
            .resolve_or_create(&[Alias::email("a@x.com"), Alias::user_id("u1")])
            .unwrap();
        let second = graph
            .resolve_or_create(&[Alias::user_id("u1"), Alias::device_id("d1")])
            .unwrap();

        assert_eq!(first.key, second.key);
        assert!(!second.created);
        assert_eq!(graph.group_count(), 1);
        let aliases = graph.aliases_of(&first.key).unwrap();
        assert_eq!(values(&aliases), BTreeSet::from(["a@x.com", "u1", "d1"]));
    }

    #[test]
    fn test_bridging_alias_merges_into_smallest_key() {
        let graph = IdentityGraph::new();
        let a = graph.resolve_or_create(&[Alias::email("a@x.com")]).unwrap();
        let b = graph.resolve_or_create(&[Alias::device_id("d9")]).unwrap();
        assert_ne!(a.key, b.key);
        assert_eq!(graph.group_count(), 2);

        let merged = graph
            .resolve_or_create(&[Alias::device_id("d9"), Alias::email("a@x.com")])
            .unwrap();

        let survivor = a.key.clone().min(b.key.clone());
        let retired = a.key.clone().max(b.key.clone());
        assert_eq!(merged.key, survivor);
        assert_eq!(merged.merged_keys, vec![retired.clone()]);
        assert_eq!(graph.group_count(), 1);
        assert_eq!(graph.find(&retired), Some(survivor.clone()));
        assert_eq!(graph.aliases_of(&retired).unwrap().len(), 2);
        graph.check_consistency().unwrap();
    }

    #[test]
    fn test_forwarding_stays_flat_across_chained_merges() {
        let graph = IdentityGraph::new();
        let keys: Vec<String> = ["d1", "d2", "d3", "d4"]
            .iter()
            .map(|d| graph.resolve_or_create(&[Alias::device_id(*d)]).unwrap().key)
            .collect();

        graph
            .resolve_or_create(&[Alias::device_id("d1"), Alias::device_id("d2")])
            .unwrap();
        graph
            .resolve_or_create(&[Alias::device_id("d3"), Alias::device_id("d4")])
            .unwrap();
        let last = graph
            .resolve_or_create(&[Alias::device_id("d2"), Alias::device_id("d3")])
            .unwrap();

        let smallest = keys.iter().min().cloned().unwrap();
        assert_eq!(last.key, smallest);
        for key in &keys {
            assert_eq!(graph.find(key), Some(smallest.clone()));
        }
        graph.check_consistency().unwrap();
    }

    #[test]
    fn test_try_resolve_requests_locks_for_repointed_profiles() {
        let graph = IdentityGraph::new();
        let now = Utc::now();
        let own = |id: &str| BTreeSet::from([id.to_string()]);

        let ResolveAttempt::Resolved(r1) = graph
            .try_resolve(&[Alias::email("a@x.com")], Some("p1"), &own("p1"), now)
            .unwrap()
        else {
            panic!("single profile resolution needs no extra locks");
        };
        graph
            .try_resolve(&[Alias::device_id("d1")], Some("p2"), &own("p2"), now)
            .unwrap();

        // Bridging both groups from p3 re-points p1 and p2.
        let bridge = [Alias::email("a@x.com"), Alias::device_id("d1")];
        let attempt = graph.try_resolve(&bridge, Some("p3"), &own("p3"), now).unwrap();
        let ResolveAttempt::NeedsLocks(required) = attempt else {
            panic!("merge must ask for locks");
        };
        assert_eq!(required, BTreeSet::from(["p1".into(), "p2".into(), "p3".into()]));
        assert_eq!(graph.group_count(), 2, "nothing changes until locks are held");

        let attempt = graph.try_resolve(&bridge, Some("p3"), &required, now).unwrap();
        let ResolveAttempt::Resolved(resolution) = attempt else {
            panic!("all locks held");
        };
        assert_eq!(resolution.merged_keys.len(), 1);
        assert!(!resolution.repointed_profiles.contains("p3"));
        assert_eq!(graph.group_count(), 1);
        let group = graph.group(&r1.key).unwrap();
        assert_eq!(group.profiles.len(), 3);
        for profile in ["p1", "p2", "p3"] {
            assert_eq!(graph.key_for_profile(profile), Some(resolution.key.clone()));
        }
    }

    #[test]
    fn test_profile_moving_to_other_group_merges_them() {
        let graph = IdentityGraph::new();
        let now = Utc::now();
        let p1 = BTreeSet::from(["p1".to_string()]);
        graph
            .try_resolve(&[Alias::email("old@x.com")], Some("p1"), &p1, now)
            .unwrap();
        graph.resolve_or_create(&[Alias::device_id("d7")]).unwrap();

        let attempt = graph
            .try_resolve(&[Alias::device_id("d7")], Some("p1"), &p1, now)
            .unwrap();
        assert!(matches!(attempt, ResolveAttempt::Resolved(ref r) if r.merged_keys.len() == 1));
        assert_eq!(graph.group_count(), 1);
    }

    #[test]
    fn test_erase_drops_orphaned_group() {
        let graph = IdentityGraph::new();
        let now = Utc::now();
        let locked = BTreeSet::from(["p1".to_string(), "p2".to_string()]);
        graph
            .try_resolve(&[Alias::email("a@x.com")], Some("p1"), &locked, now)
            .unwrap();
        graph
            .try_resolve(&[Alias::email("a@x.com"), Alias::user_id("u2")], Some("p2"), &locked, now)
            .unwrap();
        assert!(graph.holds("p1"));

        graph.erase("p1");
        assert!(!graph.holds("p1"));
        assert_eq!(graph.alias_count(), 2, "p2 still owns the group");

        graph.erase("p2");
        assert_eq!(graph.group_count(), 0);
        assert_eq!(graph.alias_count(), 0);
        assert!(graph.lookup(&Alias::email("a@x.com")).is_none());
        graph.check_consistency().unwrap();

        // Erasing twice is harmless.
        graph.erase("p2");
    }

    #[test]
    fn test_link_and_unlink_profile() {
        let graph = IdentityGraph::new();
        let resolution = graph.resolve_or_create(&[Alias::user_id("u5")]).unwrap();

        assert!(graph.link_profile("missing", "p1").unwrap_err().is_not_found());
        assert_eq!(graph.link_profile(&resolution.key, "p1").unwrap(), resolution.key);
        assert_eq!(graph.linked_profiles(&[Alias::user_id("u5")]).len(), 1);

        assert_eq!(graph.unlink_profile("p1"), Some(resolution.key.clone()));
        assert!(graph.linked_profiles(&[Alias::user_id("u5")]).is_empty());
        assert_eq!(graph.alias_count(), 1, "unlinking keeps aliases");
    }
}
