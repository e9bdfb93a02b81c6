/**
 * DELTA - Réconciliation entre la liste en cache et la liste fraîchement fetchée
 *
 * RÔLE :
 * Calcule ajouts / suppressions / modifications entre deux générations d'une
 * même liste et produit la nouvelle génération complète (jamais un patch).
 *
 * FONCTIONNEMENT :
 * - Jointure par identifiant ; `incoming` fait foi pour le contenu et l'ordre
 * - "updated" = même id, contenu comparable différent (champs volatils exclus)
 * - Id dupliqué dans `incoming` : la dernière occurrence gagne, à la position
 *   de la première
 * - N'appeler qu'avec un fetch RÉUSSI : une liste vide signifie "zéro ressource"
 */

use crate::models::{Resource, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct Reconciliation<T> {
    pub merged: Vec<T>,
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub updated: BTreeSet<String>,
}

impl<T> Reconciliation<T> {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty())
    }

    pub fn metadata(&self, kind: ResourceKind, qualifier: Option<&str>) -> DeltaMetadata {
        DeltaMetadata {
            kind,
            qualifier: qualifier.map(str::to_string),
            added_count: self.added.len(),
            removed_count: self.removed.len(),
            updated_count: self.updated.len(),
            added: self.added.iter().cloned().collect(),
            removed: self.removed.iter().cloned().collect(),
            updated: self.updated.iter().cloned().collect(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Trace d'une passe de réconciliation, stockée à côté de la liste (`...#delta`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaMetadata {
    pub kind: ResourceKind,
    pub qualifier: Option<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub added_count: usize,
    pub removed_count: usize,
    pub updated_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Forme générique : `id_of` joue le rôle de la clé d'identité
pub fn reconcile_by<T, I, S>(
    existing: &[T],
    incoming: Vec<T>,
    id_of: I,
    same: S,
) -> Reconciliation<T>
where
    I: Fn(&T) -> &str,
    S: Fn(&T, &T) -> bool,
{
    let previous: HashMap<&str, &T> = existing.iter().map(|r| (id_of(r), r)).collect();

    let mut position: HashMap<String, usize> = HashMap::with_capacity(incoming.len());
    let mut merged: Vec<T> = Vec::with_capacity(incoming.len());
    for record in incoming {
        let id = id_of(&record).to_string();
        match position.get(&id) {
            Some(&at) => merged[at] = record,
            None => {
                position.insert(id, merged.len());
                merged.push(record);
            }
        }
    }

    let mut added = BTreeSet::new();
    let mut updated = BTreeSet::new();
    for record in &merged {
        let id = id_of(record);
        match previous.get(id) {
            None => {
                added.insert(id.to_string());
            }
            Some(old) if !same(old, record) => {
                updated.insert(id.to_string());
            }
            Some(_) => {}
        }
    }

    let removed = previous
        .keys()
        .filter(|id| !position.contains_key(**id))
        .map(|id| id.to_string())
        .collect();

    Reconciliation {
        merged,
        added,
        removed,
        updated,
    }
}

pub fn reconcile<T: Resource>(existing: &[T], incoming: Vec<T>) -> Reconciliation<T> {
    reconcile_by(existing, incoming, |r: &T| r.id(), |a: &T, b: &T| a.same_content(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourcePool;

    fn pool(id: &str, name: &str) -> ResourcePool {
        ResourcePool {
            id: id.into(),
            name: name.into(),
            cluster_id: "domain-c1".into(),
            placeholder: false,
        }
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reconcile_add_remove_update() {
        let existing = vec![pool("a", "A"), pool("b", "B")];
        let incoming = vec![pool("b", "B2"), pool("c", "C")];
        let result = reconcile(&existing, incoming);

        assert_eq!(result.added, set(&["c"]));
        assert_eq!(result.removed, set(&["a"]));
        assert_eq!(result.updated, set(&["b"]));
        let ids: Vec<&str> = result.merged.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(result.merged[0].name, "B2");
    }

    #[test]
    fn test_reconcile_with_itself_is_noop() {
        let list = vec![pool("a", "A"), pool("b", "B")];
        let result = reconcile(&list, list.clone());
        assert!(!result.has_changes());
        assert_eq!(result.merged, list);
    }

    #[test]
    fn test_empty_existing_adds_everything() {
        let result = reconcile(&[], vec![pool("a", "A")]);
        assert_eq!(result.added, set(&["a"]));
        assert!(result.removed.is_empty());
    }

    #[test]
    fn test_empty_incoming_removes_everything() {
        let result = reconcile(&[pool("a", "A"), pool("b", "B")], Vec::new());
        assert_eq!(result.removed, set(&["a", "b"]));
        assert!(result.merged.is_empty());
    }

    #[test]
    fn test_placeholder_flag_is_not_an_update() {
        let mut placeholder = pool("a", "A");
        placeholder.placeholder = true;
        let result = reconcile(&[placeholder], vec![pool("a", "A")]);
        assert!(result.updated.is_empty());
        assert!(!result.merged[0].placeholder);
    }

    #[test]
    fn test_duplicate_incoming_ids_keep_last_value_first_position() {
        let result = reconcile(&[], vec![pool("a", "A1"), pool("b", "B"), pool("a", "A2")]);
        assert_eq!(result.merged.len(), 2);
        assert_eq!(result.merged[0].name, "A2");
        assert_eq!(result.merged[1].id, "b");
    }

    #[test]
    fn test_reconcile_by_custom_key() {
        let existing = vec![("x", 1), ("y", 2)];
        let result = reconcile_by(&existing, vec![("x", 1), ("y", 3)], |r| r.0, |a, b| a.1 == b.1);
        assert_eq!(result.updated, set(&["y"]));
    }

    #[test]
    fn test_metadata_counts() {
        let result = reconcile(&[pool("a", "A")], vec![pool("c", "C")]);
        let meta = result.metadata(ResourceKind::ResourcePool, Some("domain-c1"));
        assert_eq!((meta.added_count, meta.removed_count, meta.updated_count), (1, 1, 0));
        assert_eq!(meta.added, vec!["c"]);
    }
}
