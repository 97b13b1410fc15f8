//! Merging buffered pokes into one combined poke.

use std::collections::BTreeMap;

use super::types::{PokeBody, PokePart, PokeStart};
use super::PokeError;

/// Collapses a run of pokes into a single poke spanning from the first
/// base cookie to the last cookie.
///
/// The chain must be gapless: each poke's base cookie may not exceed the
/// previous poke's cookie. `lastMutationIDChanges` are merged last writer
/// wins by part order; all patch lists are concatenated preserving
/// intra-part order, so applying the merged poke is equivalent to applying
/// the inputs in sequence.
pub fn merge_pokes(pokes: &[PokeBody]) -> Result<PokeBody, PokeError> {
    let first = pokes.first().ok_or(PokeError::EmptyMerge)?;

    let mut cookie = first.start.base_version()?;
    for poke in pokes {
        let base = poke.start.base_version()?;
        if base > cookie {
            return Err(PokeError::CookieGap {
                base: base.to_cookie(),
                cookie: cookie.to_cookie(),
            });
        }
        cookie = poke.start.cookie_version()?;
    }

    let last = pokes.last().expect("non-empty checked above");
    let mut merged = PokePart::new(first.start.poke_id.clone());
    for poke in pokes {
        for part in &poke.parts {
            if let Some(changes) = &part.last_mutation_id_changes {
                merged
                    .last_mutation_id_changes
                    .get_or_insert_with(BTreeMap::new)
                    .extend(changes.iter().map(|(c, id)| (c.clone(), *id)));
            }
            if let Some(ops) = &part.clients_patch {
                merged
                    .clients_patch
                    .get_or_insert_with(Vec::new)
                    .extend(ops.iter().cloned());
            }
            if let Some(per_client) = &part.desired_queries_patches {
                let target = merged
                    .desired_queries_patches
                    .get_or_insert_with(BTreeMap::new);
                for (client, ops) in per_client {
                    target
                        .entry(client.clone())
                        .or_default()
                        .extend(ops.iter().cloned());
                }
            }
            if let Some(ops) = &part.got_queries_patch {
                merged
                    .got_queries_patch
                    .get_or_insert_with(Vec::new)
                    .extend(ops.iter().cloned());
            }
            if let Some(ops) = &part.rows_patch {
                merged
                    .rows_patch
                    .get_or_insert_with(Vec::new)
                    .extend(ops.iter().cloned());
            }
        }
    }

    let mut body = PokeBody::new(PokeStart {
        poke_id: first.start.poke_id.clone(),
        base_cookie: first.start.base_cookie.clone(),
        cookie: last.start.cookie.clone(),
        schema_versions: first.start.schema_versions,
    });
    if !merged.is_empty() {
        body.parts.push(merged);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ClientId;
    use crate::poke::RowPatchOp;
    use serde_json::json;

    fn poke(id: &str, base: Option<&str>, cookie: &str, parts: Vec<PokePart>) -> PokeBody {
        PokeBody {
            start: PokeStart {
                poke_id: id.to_string(),
                base_cookie: base.map(|s| s.to_string()),
                cookie: cookie.to_string(),
                schema_versions: None,
            },
            parts,
        }
    }

    fn row_put(poke_id: &str, table: &str, title: &str) -> PokePart {
        PokePart {
            rows_patch: Some(vec![RowPatchOp::Put {
                table_name: table.to_string(),
                value: json!({"title": title}),
            }]),
            ..PokePart::new(poke_id)
        }
    }

    #[test]
    fn spans_base_to_final_cookie() {
        let merged = merge_pokes(&[
            poke("p1", None, "00", vec![row_put("p1", "t", "a")]),
            poke("p2", Some("00"), "01", vec![row_put("p2", "t", "b")]),
        ])
        .unwrap();
        assert_eq!(merged.start.base_cookie, None);
        assert_eq!(merged.start.cookie, "01");
        assert_eq!(merged.parts.len(), 1);
        let rows = merged.parts[0].rows_patch.as_ref().unwrap();
        assert_eq!(rows.len(), 2);
        // Intra-part order survives the merge.
        assert!(matches!(
            &rows[0],
            RowPatchOp::Put { value, .. } if value["title"] == "a"
        ));
    }

    #[test]
    fn detects_cookie_gap() {
        let err = merge_pokes(&[
            poke("p1", None, "01", vec![]),
            poke("p2", Some("02"), "03", vec![]),
        ])
        .unwrap_err();
        assert!(matches!(err, PokeError::CookieGap { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn overlapping_bases_are_allowed() {
        // A poke may restate an older base (replay after reconnect).
        merge_pokes(&[
            poke("p1", None, "02", vec![]),
            poke("p2", Some("01"), "03", vec![]),
        ])
        .unwrap();
    }

    #[test]
    fn lmid_changes_are_last_writer_wins() {
        let c1 = ClientId::new("c1").unwrap();
        let part = |id: &str, lmid: u64| PokePart {
            last_mutation_id_changes: Some([(c1.clone(), lmid)].into()),
            ..PokePart::new(id)
        };
        let merged = merge_pokes(&[
            poke("p1", None, "00", vec![part("p1", 4)]),
            poke("p2", Some("00"), "01", vec![part("p2", 7)]),
        ])
        .unwrap();
        assert_eq!(
            merged.parts[0]
                .last_mutation_id_changes
                .as_ref()
                .unwrap()
                .get(&c1),
            Some(&7)
        );
    }

    #[test]
    fn merging_nothing_fails() {
        assert!(matches!(merge_pokes(&[]), Err(PokeError::EmptyMerge)));
    }
}
