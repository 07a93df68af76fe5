//! Post-apply entity snapshot builder.
//!
//! After a zone's deltas commit, the broadcast layer needs the authoritative
//! entity list for that zone without a second round-trip to the store. The
//! merge below combines the pre-tick list with the rows the gateway actually
//! wrote: deletes drop out, updated rows replace their originals, created
//! rows append. Same-tick creates and deletes are therefore visible in the
//! very tick that produced them.

use crate::store::AppliedDeltas;
use shared::Entity;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Build the authoritative post-apply entity list for one zone.
pub fn post_apply(pre_tick: Vec<Entity>, deletes: &[Uuid], applied: &AppliedDeltas) -> Vec<Entity> {
    let deleted: HashSet<Uuid> = deletes.iter().copied().collect();
    let updated: HashMap<Uuid, &Entity> = applied.updated.iter().map(|e| (e.id, e)).collect();

    let mut snapshot: Vec<Entity> = pre_tick
        .into_iter()
        .filter(|e| !deleted.contains(&e.id))
        .map(|e| updated.get(&e.id).map(|u| (*u).clone()).unwrap_or(e))
        .collect();
    snapshot.extend(applied.created.iter().cloned());
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entity(x: i32, y: i32) -> Entity {
        Entity {
            id: Uuid::new_v4(),
            zone_id: Uuid::new_v4(),
            x,
            y,
            width: 1,
            height: 1,
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn creates_are_visible_same_tick() {
        let created = entity(3, 4);
        let applied = AppliedDeltas {
            created: vec![created.clone()],
            ..AppliedDeltas::default()
        };

        let snapshot = post_apply(Vec::new(), &[], &applied);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, created.id);
    }

    #[test]
    fn deletes_disappear_same_tick() {
        let keep = entity(0, 0);
        let gone = entity(1, 1);
        let snapshot = post_apply(
            vec![keep.clone(), gone.clone()],
            &[gone.id],
            &AppliedDeltas::default(),
        );
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, keep.id);
    }

    #[test]
    fn updates_replace_originals() {
        let original = entity(0, 0);
        let mut moved = original.clone();
        moved.x = 7;
        let applied = AppliedDeltas {
            updated: vec![moved],
            ..AppliedDeltas::default()
        };

        let snapshot = post_apply(vec![original.clone()], &[], &applied);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, original.id);
        assert_eq!(snapshot[0].x, 7);
    }

    #[test]
    fn mixed_deltas_compose() {
        let stays = entity(0, 0);
        let moves = entity(1, 1);
        let dies = entity(2, 2);
        let mut moved = moves.clone();
        moved.y = 9;
        let born = entity(5, 5);

        let applied = AppliedDeltas {
            created: vec![born.clone()],
            updated: vec![moved],
            skipped: 0,
        };
        let snapshot = post_apply(
            vec![stays.clone(), moves.clone(), dies.clone()],
            &[dies.id],
            &applied,
        );

        assert_eq!(snapshot.len(), 3);
        let ids: Vec<Uuid> = snapshot.iter().map(|e| e.id).collect();
        assert!(ids.contains(&stays.id));
        assert!(ids.contains(&moves.id));
        assert!(ids.contains(&born.id));
        assert!(!ids.contains(&dies.id));
        assert_eq!(snapshot.iter().find(|e| e.id == moves.id).unwrap().y, 9);
    }
}
