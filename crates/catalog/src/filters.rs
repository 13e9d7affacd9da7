use std::collections::BTreeMap;

use common::{
    context::RequestContext,
    runtime::UnixTimestamp,
    types::{
        ContainerFormat,
        DiskFormat,
        ImageStatus,
    },
};
use rusqlite::types::Value;

use crate::types::to_nanos;

/// Listing predicates, composed with conjunction. Everything is optional;
/// an empty filter set lists all live images the caller may see.
#[derive(Clone, Debug, Default)]
pub struct ImageFilters {
    pub name: Option<String>,
    pub status: Option<ImageStatus>,
    pub disk_format: Option<DiskFormat>,
    pub container_format: Option<ContainerFormat>,
    pub owner: Option<String>,
    pub checksum: Option<String>,
    /// Tri-valued: Some(true) also matches images the caller owns or is a
    /// member of, Some(false) matches private only, None matches any.
    pub is_public: Option<bool>,
    pub protected: Option<bool>,
    /// Some(false) additionally excludes killed images. None hides deleted
    /// rows unless the context may see them.
    pub deleted: Option<bool>,
    /// `updated_at > ts`; implicitly enables show-deleted.
    pub changes_since: Option<UnixTimestamp>,
    pub size_min: Option<u64>,
    pub size_max: Option<u64>,
    pub min_disk_min: Option<u64>,
    pub min_disk_max: Option<u64>,
    pub min_ram_min: Option<u64>,
    pub min_ram_max: Option<u64>,
    /// Each pair must match a live property row on both name and value.
    pub properties: BTreeMap<String, String>,
}

impl ImageFilters {
    /// Whether this filter set reaches into soft-deleted rows. The marker
    /// row is resolved under the same setting so pagination over a deleted
    /// listing can chain.
    pub fn showing_deleted(&self) -> bool {
        self.changes_since.is_some() || self.deleted.unwrap_or(false)
    }

    /// Append WHERE clauses and their parameters. Clauses are combined with
    /// AND by the caller.
    pub(crate) fn apply(
        &self,
        ctx: &RequestContext,
        clauses: &mut Vec<String>,
        params: &mut Vec<Value>,
    ) {
        if let Some(ref name) = self.name {
            clauses.push(format!("name = ?{}", params.len() + 1));
            params.push(Value::Text(name.clone()));
        }
        if let Some(status) = self.status {
            clauses.push(format!("status = ?{}", params.len() + 1));
            params.push(Value::Text(status.to_string()));
        }
        if let Some(format) = self.disk_format {
            clauses.push(format!("disk_format = ?{}", params.len() + 1));
            params.push(Value::Text(format.to_string()));
        }
        if let Some(format) = self.container_format {
            clauses.push(format!("container_format = ?{}", params.len() + 1));
            params.push(Value::Text(format.to_string()));
        }
        if let Some(ref owner) = self.owner {
            clauses.push(format!("owner = ?{}", params.len() + 1));
            params.push(Value::Text(owner.clone()));
        }
        if let Some(ref checksum) = self.checksum {
            clauses.push(format!("checksum = ?{}", params.len() + 1));
            params.push(Value::Text(checksum.clone()));
        }
        if let Some(protected) = self.protected {
            clauses.push(format!("protected = ?{}", params.len() + 1));
            params.push(Value::Integer(protected as i64));
        }

        match self.is_public {
            Some(true) => {
                // Public listing widens to what the caller owns or was
                // granted, matching the visibility rules.
                if let Some(owner) = ctx.owner() {
                    clauses.push(format!(
                        "(is_public = 1 OR owner = ?{} OR {})",
                        params.len() + 1,
                        live_membership_clause(params.len() + 2),
                    ));
                    params.push(Value::Text(owner.to_owned()));
                    params.push(Value::Text(owner.to_owned()));
                } else {
                    clauses.push("is_public = 1".to_owned());
                }
            },
            Some(false) => clauses.push("is_public = 0".to_owned()),
            None => {},
        }

        if let Some(changes_since) = self.changes_since {
            clauses.push(format!("updated_at > ?{}", params.len() + 1));
            params.push(Value::Integer(to_nanos(changes_since)));
        }

        match self.deleted {
            Some(true) => clauses.push("deleted = 1".to_owned()),
            Some(false) => {
                clauses.push("deleted = 0".to_owned());
                clauses.push("status != 'killed'".to_owned());
            },
            None => {
                if self.changes_since.is_none() && !ctx.show_deleted() {
                    clauses.push("deleted = 0".to_owned());
                }
            },
        }

        for (name, value) in &self.properties {
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM image_properties p WHERE p.image_id = images.id AND \
                 p.name = ?{} AND p.value = ?{} AND p.deleted = 0)",
                params.len() + 1,
                params.len() + 2,
            ));
            params.push(Value::Text(name.clone()));
            params.push(Value::Text(value.clone()));
        }

        let ranges = [
            ("size", ">=", self.size_min),
            ("size", "<=", self.size_max),
            ("min_disk", ">=", self.min_disk_min),
            ("min_disk", "<=", self.min_disk_max),
            ("min_ram", ">=", self.min_ram_min),
            ("min_ram", "<=", self.min_ram_max),
        ];
        for (column, op, bound) in ranges {
            if let Some(bound) = bound {
                clauses.push(format!("{column} {op} ?{}", params.len() + 1));
                params.push(Value::Integer(bound as i64));
            }
        }

        // Private images not owned by or shared with the caller never show
        // up for non-admins, whatever the other filters say.
        if !ctx.is_admin {
            if let Some(owner) = ctx.owner() {
                clauses.push(format!(
                    "(is_public = 1 OR owner IS NULL OR owner = ?{} OR {})",
                    params.len() + 1,
                    live_membership_clause(params.len() + 2),
                ));
                params.push(Value::Text(owner.to_owned()));
                params.push(Value::Text(owner.to_owned()));
            } else {
                clauses.push("(is_public = 1 OR owner IS NULL)".to_owned());
            }
        }
    }
}

fn live_membership_clause(param_index: usize) -> String {
    format!(
        "EXISTS (SELECT 1 FROM image_members m WHERE m.image_id = images.id AND m.member = \
         ?{param_index} AND m.deleted = 0)"
    )
}
