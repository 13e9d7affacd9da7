use common::{
    knobs::API_LIMIT_MAX,
    types::{
        ImageId,
        SortDir,
    },
};
use errors::ErrorMetadata;
use rusqlite::types::Value;

/// Image attributes a caller may sort by. Anything else is an
/// `InvalidSortKey`.
pub const SORTABLE_ATTRS: &[&str] = &[
    "id",
    "name",
    "status",
    "disk_format",
    "container_format",
    "size",
    "checksum",
    "min_disk",
    "min_ram",
    "owner",
    "is_public",
    "protected",
    "created_at",
    "updated_at",
    "deleted_at",
];

#[derive(Clone, Debug, Default)]
pub struct Pagination {
    /// Id of the last row of the previous page.
    pub marker: Option<ImageId>,
    pub limit: Option<i64>,
    pub sort_key: Option<String>,
    pub sort_dir: Option<SortDir>,
}

impl Pagination {
    /// The sort tuple is always suffixed with `created_at` and `id` so it is
    /// unique in combination, whatever the user-chosen key.
    pub(crate) fn sort_keys(&self) -> anyhow::Result<Vec<&str>> {
        let user_key = match self.sort_key {
            Some(ref key) => {
                let key = SORTABLE_ATTRS
                    .iter()
                    .find(|attr| **attr == key.as_str())
                    .ok_or_else(|| {
                        ErrorMetadata::bad_request(
                            "InvalidSortKey",
                            format!("Sort key '{key}' is not a sortable image attribute"),
                        )
                    })?;
                *key
            },
            None => "created_at",
        };
        let mut keys = vec![user_key];
        for suffix in ["created_at", "id"] {
            if !keys.contains(&suffix) {
                keys.push(suffix);
            }
        }
        Ok(keys)
    }

    /// A single direction is broadcast across the whole sort tuple.
    pub(crate) fn sort_dirs(&self, len: usize) -> Vec<SortDir> {
        vec![self.sort_dir.unwrap_or(SortDir::Desc); len]
    }

    pub(crate) fn effective_limit(&self) -> anyhow::Result<usize> {
        let limit = match self.limit {
            Some(limit) if limit <= 0 => anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidLimit",
                format!("limit must be positive, got {limit}"),
            )),
            Some(limit) => limit as usize,
            None => *common::knobs::DEFAULT_PAGE_SIZE,
        };
        Ok(limit.min(*API_LIMIT_MAX))
    }
}

pub(crate) fn order_by(sort_keys: &[&str], sort_dirs: &[SortDir]) -> String {
    let clauses: Vec<String> = sort_keys
        .iter()
        .zip(sort_dirs)
        .map(|(key, dir)| {
            let dir = match dir {
                SortDir::Asc => "ASC",
                SortDir::Desc => "DESC",
            };
            format!("{key} {dir}")
        })
        .collect();
    format!("ORDER BY {}", clauses.join(", "))
}

/// Keyset predicate: emit rows whose sort tuple strictly follows the
/// marker's in lexicographic order under the per-key directions.
///
/// With a compound sort tuple (k1, k2, k3) this repeats the lexicographic
/// ordering:
/// (k1 > X1) or (k1 == X1 && k2 > X2) or (k1 == X1 && k2 == X2 && k3 > X3)
/// where `>` flips to `<` for descending keys.
pub(crate) fn marker_predicate(
    sort_keys: &[&str],
    sort_dirs: &[SortDir],
    marker_values: &[Value],
    clauses: &mut Vec<String>,
    params: &mut Vec<Value>,
) {
    assert_eq!(sort_keys.len(), marker_values.len());
    let mut alternatives = Vec::new();
    for i in 0..sort_keys.len() {
        let mut criteria = Vec::new();
        for j in 0..i {
            criteria.push(format!("{} = ?{}", sort_keys[j], params.len() + 1));
            params.push(marker_values[j].clone());
        }
        let op = match sort_dirs[i] {
            SortDir::Asc => ">",
            SortDir::Desc => "<",
        };
        criteria.push(format!("{} {op} ?{}", sort_keys[i], params.len() + 1));
        params.push(marker_values[i].clone());
        alternatives.push(format!("({})", criteria.join(" AND ")));
    }
    clauses.push(format!("({})", alternatives.join(" OR ")));
}

#[cfg(test)]
mod tests {
    use common::types::SortDir;
    use rusqlite::types::Value;

    use super::{
        marker_predicate,
        order_by,
        Pagination,
    };

    #[test]
    fn test_sort_tuple_is_unique_in_combination() -> anyhow::Result<()> {
        let pagination = Pagination {
            sort_key: Some("name".to_owned()),
            ..Default::default()
        };
        assert_eq!(pagination.sort_keys()?, vec!["name", "created_at", "id"]);

        // No duplicate suffix when the user picks one of the tiebreakers.
        let pagination = Pagination {
            sort_key: Some("created_at".to_owned()),
            ..Default::default()
        };
        assert_eq!(pagination.sort_keys()?, vec!["created_at", "id"]);
        Ok(())
    }

    #[test]
    fn test_unknown_sort_key_rejected() {
        let pagination = Pagination {
            sort_key: Some("frobnitz".to_owned()),
            ..Default::default()
        };
        assert!(pagination.sort_keys().is_err());
    }

    #[test]
    fn test_marker_predicate_shape() {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        marker_predicate(
            &["name", "id"],
            &[SortDir::Asc, SortDir::Asc],
            &[
                Value::Text("asdf".to_owned()),
                Value::Text("uuid3".to_owned()),
            ],
            &mut clauses,
            &mut params,
        );
        assert_eq!(
            clauses,
            vec!["((name > ?1) OR (name = ?2 AND id > ?3))".to_owned()]
        );
        assert_eq!(params.len(), 3);
        assert_eq!(
            order_by(&["name", "id"], &[SortDir::Asc, SortDir::Desc]),
            "ORDER BY name ASC, id DESC"
        );
    }
}
