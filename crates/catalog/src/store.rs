use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    path::{
        Path,
        PathBuf,
    },
    str::FromStr,
    sync::Arc,
};

use common::{
    context::RequestContext,
    knobs::{
        DB_MAX_RETRIES,
        DB_RETRIABLE_ERROR_CODES,
        DB_RETRY_INTERVAL,
    },
    runtime::{
        Runtime,
        UnixTimestamp,
    },
    types::{
        ImageId,
        ImageStatus,
        MemberStatus,
    },
};
use errors::ErrorMetadata;
use parking_lot::{
    Mutex,
    MutexGuard,
};
use rusqlite::{
    params,
    params_from_iter,
    types::Value,
    Connection,
    ErrorCode,
    Row,
    TransactionBehavior,
};

use crate::{
    filters::ImageFilters,
    pagination::{
        marker_predicate,
        order_by,
        Pagination,
    },
    schema,
    types::{
        from_nanos,
        to_nanos,
        Image,
        ImageLocation,
        ImageMember,
        ImageValues,
        LocationStatus,
        MemberValues,
    },
    visibility,
};

// A single SQLite connection serializes writers on its own; the mutex is the
// in-process equivalent of the per-image row lock, and `BEGIN IMMEDIATE`
// takes the database write lock up front so a transaction never deadlocks
// upgrading.
pub struct CatalogStore<RT: Runtime> {
    rt: RT,
    inner: Arc<Mutex<Inner>>,
}

impl<RT: Runtime> Clone for CatalogStore<RT> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            inner: self.inner.clone(),
        }
    }
}

struct Inner {
    connection: Connection,
    path: Option<PathBuf>,
    last_ts_nanos: i64,
}

impl<RT: Runtime> CatalogStore<RT> {
    pub fn new(rt: RT, path: &Path) -> anyhow::Result<Self> {
        let mut connection = Connection::open(path)?;
        schema::migrate(&mut connection)?;
        Ok(Self {
            rt,
            inner: Arc::new(Mutex::new(Inner {
                connection,
                path: Some(path.to_owned()),
                last_ts_nanos: 0,
            })),
        })
    }

    pub fn new_in_memory(rt: RT) -> anyhow::Result<Self> {
        let mut connection = Connection::open_in_memory()?;
        schema::migrate(&mut connection)?;
        Ok(Self {
            rt,
            inner: Arc::new(Mutex::new(Inner {
                connection,
                path: None,
                last_ts_nanos: 0,
            })),
        })
    }

    /// Check out the connection, probing liveness first. A handle that fails
    /// the probe is reopened rather than returned, so a transient
    /// disconnection costs one retry instead of poisoning every caller.
    fn checkout(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock();
        if inner
            .connection
            .query_row("SELECT 1", [], |_| Ok(()))
            .is_err()
        {
            tracing::warn!("Catalog connection failed its liveness probe, reopening");
            if let Some(path) = inner.path.clone() {
                match Connection::open(&path) {
                    Ok(connection) => inner.connection = connection,
                    Err(e) => tracing::warn!("Could not reopen catalog at {path:?}: {e}"),
                }
            }
        }
        inner
    }

    /// A strictly monotonic wall clock. Soft-delete timestamps participate
    /// in uniqueness constraints, so two deletes in the same nanosecond must
    /// still be distinguishable.
    fn next_timestamp(&self, inner: &mut Inner) -> i64 {
        let now = to_nanos(self.rt.unix_timestamp());
        let nanos = now.max(inner.last_ts_nanos + 1);
        inner.last_ts_nanos = nanos;
        nanos
    }

    /// Run an operation, retrying transient connectivity errors up to the
    /// configured budget with a sleep between attempts.
    async fn with_retries<T>(
        &self,
        name: &'static str,
        f: impl Fn(&mut Inner) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut remaining_attempts = *DB_MAX_RETRIES;
        loop {
            let result = {
                let mut inner = self.checkout();
                f(&mut inner)
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if remaining_attempts > 0 && is_transient(&e) => {
                    tracing::warn!(
                        "Catalog connection failed in {name}. {remaining_attempts} attempts left."
                    );
                    remaining_attempts -= 1;
                    self.rt.wait(*DB_RETRY_INTERVAL).await;
                },
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn image_create(
        &self,
        ctx: &RequestContext,
        values: ImageValues,
    ) -> anyhow::Result<Image> {
        // The id must be stable across retry attempts.
        let id = values
            .id
            .clone()
            .unwrap_or_else(|| ImageId::generate(&self.rt));
        let ctx = ctx.clone();
        self.with_retries("image_create", move |inner| {
            let now = self.next_timestamp(inner);
            let tx = inner
                .connection
                .transaction_with_behavior(TransactionBehavior::Immediate)?;

            let name = values.name.clone().flatten();
            let status = values.status.unwrap_or(ImageStatus::Queued);
            let disk_format = values.disk_format.flatten();
            let container_format = values.container_format.flatten();
            // Canonicalize ownership: an empty owner means no owner at all.
            let owner = values
                .owner
                .clone()
                .flatten()
                .filter(|owner| !owner.is_empty());
            ImageValues::validate(status, name.as_deref(), disk_format, container_format)?;

            let inserted = tx.execute(
                INSERT_IMAGE,
                params![
                    id.as_str(),
                    name,
                    status.to_string(),
                    disk_format.map(|f| f.to_string()),
                    container_format.map(|f| f.to_string()),
                    values.size.unwrap_or(0) as i64,
                    values.checksum.clone().flatten(),
                    values.min_disk.unwrap_or(0) as i64,
                    values.min_ram.unwrap_or(0) as i64,
                    owner,
                    values.is_public.unwrap_or(false),
                    values.protected.unwrap_or(false),
                    now,
                    now,
                ],
            );
            if let Err(e) = inserted {
                if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
                    anyhow::bail!(ErrorMetadata::conflict(
                        "ImageIdExists",
                        format!("Image ID {id} already exists!"),
                    ));
                }
                return Err(e.into());
            }

            if let Some(ref properties) = values.properties {
                upsert_properties(&tx, &id, properties, now)?;
            }
            if let Some(ref locations) = values.locations {
                replace_locations(&tx, &id, locations, now)?;
            }

            let image = load_image(&tx, &ctx, &id, true)?;
            tx.commit()?;
            tracing::info!("Created image {id} in status {}", image.status);
            Ok(image)
        })
        .await
    }

    pub async fn image_update(
        &self,
        ctx: &RequestContext,
        id: &ImageId,
        values: ImageValues,
        purge_properties: bool,
    ) -> anyhow::Result<Image> {
        let ctx = ctx.clone();
        let id = id.clone();
        self.with_retries("image_update", move |inner| {
            let now = self.next_timestamp(inner);
            let tx = inner
                .connection
                .transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing = load_image(&tx, &ctx, &id, false)?;
            visibility::check_mutate_authorization(&ctx, &existing)?;
            if existing.deleted {
                anyhow::bail!(ErrorMetadata::forbidden(
                    "ImageDeleted",
                    format!("Image {id} is deleted and can no longer be updated"),
                ));
            }

            let name = values.name.clone().unwrap_or(existing.name);
            let status = values.status.unwrap_or(existing.status);
            let disk_format = values.disk_format.unwrap_or(existing.disk_format);
            let container_format = values
                .container_format
                .unwrap_or(existing.container_format);
            let owner = values
                .owner
                .clone()
                .unwrap_or(existing.owner)
                .filter(|owner| !owner.is_empty());
            ImageValues::validate(status, name.as_deref(), disk_format, container_format)?;

            tx.execute(
                UPDATE_IMAGE,
                params![
                    name,
                    status.to_string(),
                    disk_format.map(|f| f.to_string()),
                    container_format.map(|f| f.to_string()),
                    values.size.unwrap_or(existing.size) as i64,
                    values.checksum.clone().unwrap_or(existing.checksum),
                    values.min_disk.unwrap_or(existing.min_disk) as i64,
                    values.min_ram.unwrap_or(existing.min_ram) as i64,
                    owner,
                    values.is_public.unwrap_or(existing.is_public),
                    values.protected.unwrap_or(existing.protected),
                    now,
                    id.as_str(),
                ],
            )?;

            if let Some(ref properties) = values.properties {
                upsert_properties(&tx, &id, properties, now)?;
                if purge_properties {
                    for name in existing.properties.keys() {
                        if !properties.contains_key(name) {
                            tx.execute(
                                SOFT_DELETE_PROPERTY,
                                params![now, now, id.as_str(), name],
                            )?;
                        }
                    }
                }
            }
            if let Some(ref locations) = values.locations {
                replace_locations(&tx, &id, locations, now)?;
            }

            let image = load_image(&tx, &ctx, &id, true)?;
            tx.commit()?;
            Ok(image)
        })
        .await
    }

    /// Soft-delete the image and all of its children. The row survives for
    /// history; only the Scrubber ever touches the body bytes.
    pub async fn image_destroy(
        &self,
        ctx: &RequestContext,
        id: &ImageId,
    ) -> anyhow::Result<Image> {
        let ctx = ctx.clone();
        let id = id.clone();
        self.with_retries("image_destroy", move |inner| {
            let now = self.next_timestamp(inner);
            let tx = inner
                .connection
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing = load_image(&tx, &ctx, &id, false)?;
            visibility::check_mutate_authorization(&ctx, &existing)?;
            guard_deletable(&existing)?;

            soft_delete_image(&tx, &id, ImageStatus::Deleted, now)?;
            cascade_soft_delete(&tx, &id, now)?;
            tx.execute(
                UPDATE_LOCATION_STATUS_ALL,
                params![LocationStatus::Deleted.to_string(), now, id.as_str()],
            )?;
            tx.execute(SOFT_DELETE_LOCATIONS, params![now, now, id.as_str()])?;

            let image = load_image(&tx, &ctx, &id, true)?;
            tx.commit()?;
            tracing::info!("Deleted image {id}");
            Ok(image)
        })
        .await
    }

    /// Delayed delete: park the image for the Scrubber. Locations stay live
    /// so the body can still be found and reclaimed.
    pub async fn image_mark_pending_delete(
        &self,
        ctx: &RequestContext,
        id: &ImageId,
    ) -> anyhow::Result<Image> {
        let ctx = ctx.clone();
        let id = id.clone();
        self.with_retries("image_mark_pending_delete", move |inner| {
            let now = self.next_timestamp(inner);
            let tx = inner
                .connection
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing = load_image(&tx, &ctx, &id, false)?;
            visibility::check_mutate_authorization(&ctx, &existing)?;
            guard_deletable(&existing)?;

            soft_delete_image(&tx, &id, ImageStatus::PendingDelete, now)?;
            cascade_soft_delete(&tx, &id, now)?;
            tx.execute(
                UPDATE_LOCATION_STATUS_ALL,
                params![LocationStatus::PendingDelete.to_string(), now, id.as_str()],
            )?;

            let image = load_image(&tx, &ctx, &id, true)?;
            tx.commit()?;
            tracing::info!("Image {id} queued for delayed delete");
            Ok(image)
        })
        .await
    }

    /// The Scrubber reclaimed every body for this image. Idempotent.
    pub async fn image_scrub_complete(
        &self,
        ctx: &RequestContext,
        id: &ImageId,
    ) -> anyhow::Result<()> {
        let ctx = ctx.clone();
        let id = id.clone();
        self.with_retries("image_scrub_complete", move |inner| {
            let now = self.next_timestamp(inner);
            let tx = inner
                .connection
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing = load_image(&tx, &ctx, &id, true)?;
            if existing.status == ImageStatus::Deleted {
                return Ok(());
            }
            tx.execute(
                UPDATE_IMAGE_STATUS,
                params![ImageStatus::Deleted.to_string(), now, id.as_str()],
            )?;
            tx.execute(
                UPDATE_LOCATION_STATUS_ALL,
                params![LocationStatus::Deleted.to_string(), now, id.as_str()],
            )?;
            tx.execute(SOFT_DELETE_LOCATIONS, params![now, now, id.as_str()])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Images awaiting the Scrubber, oldest first.
    pub async fn images_pending_scrub(
        &self,
        ctx: &RequestContext,
        older_than: UnixTimestamp,
    ) -> anyhow::Result<Vec<Image>> {
        let ctx = ctx.clone();
        self.with_retries("images_pending_scrub", move |inner| {
            let connection = &inner.connection;
            let mut stmt = connection.prepare(PENDING_SCRUB)?;
            let ids = stmt
                .query_map(params![to_nanos(older_than)], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            ids.into_iter()
                .map(|id| load_image(connection, &ctx, &ImageId::from(id), true))
                .collect()
        })
        .await
    }

    pub async fn image_get(
        &self,
        ctx: &RequestContext,
        id: &ImageId,
        force_show_deleted: bool,
    ) -> anyhow::Result<Image> {
        let ctx = ctx.clone();
        let id = id.clone();
        self.with_retries("image_get", move |inner| {
            load_image(&inner.connection, &ctx, &id, force_show_deleted)
        })
        .await
    }

    /// Filtered, keyset-paginated listing.
    pub async fn image_get_all(
        &self,
        ctx: &RequestContext,
        filters: &ImageFilters,
        pagination: &Pagination,
    ) -> anyhow::Result<Vec<Image>> {
        let ctx = ctx.clone();
        let filters = filters.clone();
        let pagination = pagination.clone();
        self.with_retries("image_get_all", move |inner| {
            let connection = &inner.connection;
            let sort_keys = pagination.sort_keys()?;
            let sort_dirs = pagination.sort_dirs(sort_keys.len());
            let limit = pagination.effective_limit()?;

            let mut clauses = Vec::new();
            let mut params = Vec::new();
            filters.apply(&ctx, &mut clauses, &mut params);

            if let Some(ref marker) = pagination.marker {
                let marker_image =
                    load_image(connection, &ctx, marker, filters.showing_deleted())?;
                let marker_values: Vec<Value> = sort_keys
                    .iter()
                    .map(|key| image_sort_value(&marker_image, key))
                    .collect();
                marker_predicate(&sort_keys, &sort_dirs, &marker_values, &mut clauses, &mut params);
            }

            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            let query = format!(
                "SELECT {IMAGE_COLUMNS} FROM images {where_clause} {} LIMIT {limit}",
                order_by(&sort_keys, &sort_dirs),
            );

            let mut stmt = connection.prepare(&query)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), image_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|raw| hydrate_image(connection, raw))
                .collect()
        })
        .await
    }

    /// Find a membership association between image and member.
    ///
    /// Note lack of permissions check; the visibility rules themselves are
    /// defined in terms of this lookup.
    pub async fn image_member_find(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
        member: &str,
    ) -> anyhow::Result<ImageMember> {
        let ctx = ctx.clone();
        let image_id = image_id.clone();
        let member = member.to_owned();
        self.with_retries("image_member_find", move |inner| {
            find_member(&inner.connection, &ctx, &image_id, &member)
        })
        .await
    }

    pub async fn image_member_create(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
        values: MemberValues,
    ) -> anyhow::Result<ImageMember> {
        let ctx = ctx.clone();
        let image_id = image_id.clone();
        self.with_retries("image_member_create", move |inner| {
            let now = self.next_timestamp(inner);
            let tx = inner
                .connection
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            // The image must at least be visible to attach members to it;
            // sharability is checked by the service layer.
            load_image(&tx, &ctx, &image_id, false)?;
            let inserted = tx.execute(
                INSERT_MEMBER,
                params![
                    image_id.as_str(),
                    values.member,
                    values.can_share.unwrap_or(false),
                    values
                        .status
                        .unwrap_or(MemberStatus::Pending)
                        .to_string(),
                    now,
                    now,
                ],
            );
            if let Err(e) = inserted {
                if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
                    anyhow::bail!(ErrorMetadata::conflict(
                        "MemberAlreadyExists",
                        format!(
                            "Image {image_id} is already shared with {}",
                            values.member
                        ),
                    ));
                }
                return Err(e.into());
            }
            let member = find_member(&tx, &ctx, &image_id, &values.member)?;
            tx.commit()?;
            Ok(member)
        })
        .await
    }

    /// Replace the membership set in one transaction. Pre-existing rows in
    /// the incoming set are updated (`can_share` defaulting to the old
    /// value), pre-existing rows not in the incoming set are soft-deleted,
    /// and rows in the incoming set not yet present are created.
    pub async fn image_member_replace_all(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
        members: Vec<MemberValues>,
    ) -> anyhow::Result<Vec<ImageMember>> {
        let ctx = ctx.clone();
        let image_id = image_id.clone();
        self.with_retries("image_member_replace_all", move |inner| {
            let now = self.next_timestamp(inner);
            let tx = inner
                .connection
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let image = load_image(&tx, &ctx, &image_id, false)?;

            for values in &members {
                match image.members.iter().find(|m| m.member == values.member) {
                    Some(existing) => {
                        tx.execute(
                            UPDATE_MEMBER,
                            params![
                                values.can_share.unwrap_or(existing.can_share),
                                values.status.unwrap_or(existing.status).to_string(),
                                now,
                                existing.id,
                            ],
                        )?;
                    },
                    None => {
                        tx.execute(
                            INSERT_MEMBER,
                            params![
                                image_id.as_str(),
                                values.member,
                                values.can_share.unwrap_or(false),
                                values
                                    .status
                                    .unwrap_or(MemberStatus::Pending)
                                    .to_string(),
                                now,
                                now,
                            ],
                        )?;
                    },
                }
            }
            for existing in &image.members {
                if !members.iter().any(|v| v.member == existing.member) {
                    tx.execute(SOFT_DELETE_MEMBER, params![now, now, existing.id])?;
                }
            }

            let replaced = load_image(&tx, &ctx, &image_id, true)?.members;
            tx.commit()?;
            Ok(replaced)
        })
        .await
    }

    pub async fn image_member_update(
        &self,
        ctx: &RequestContext,
        member_id: i64,
        values: MemberValues,
    ) -> anyhow::Result<ImageMember> {
        let ctx = ctx.clone();
        self.with_retries("image_member_update", move |inner| {
            let now = self.next_timestamp(inner);
            let tx = inner
                .connection
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing = get_member(&tx, &ctx, member_id)?;
            tx.execute(
                UPDATE_MEMBER,
                params![
                    values.can_share.unwrap_or(existing.can_share),
                    values.status.unwrap_or(existing.status).to_string(),
                    now,
                    member_id,
                ],
            )?;
            let member = get_member(&tx, &ctx, member_id)?;
            tx.commit()?;
            Ok(member)
        })
        .await
    }

    pub async fn image_member_delete(
        &self,
        ctx: &RequestContext,
        member_id: i64,
    ) -> anyhow::Result<()> {
        let ctx = ctx.clone();
        self.with_retries("image_member_delete", move |inner| {
            let now = self.next_timestamp(inner);
            let tx = inner
                .connection
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            get_member(&tx, &ctx, member_id)?;
            tx.execute(SOFT_DELETE_MEMBER, params![now, now, member_id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn image_member_get(
        &self,
        ctx: &RequestContext,
        member_id: i64,
    ) -> anyhow::Result<ImageMember> {
        let ctx = ctx.clone();
        self.with_retries("image_member_get", move |inner| {
            get_member(&inner.connection, &ctx, member_id)
        })
        .await
    }

    /// All image memberships for the given member, newest first, keyset
    /// paginated by (created_at, id).
    pub async fn image_member_get_memberships(
        &self,
        ctx: &RequestContext,
        member: &str,
        marker: Option<i64>,
        limit: Option<i64>,
    ) -> anyhow::Result<Vec<ImageMember>> {
        let ctx = ctx.clone();
        let member = member.to_owned();
        self.with_retries("image_member_get_memberships", move |inner| {
            let connection = &inner.connection;
            let limit = match limit {
                Some(limit) if limit <= 0 => anyhow::bail!(ErrorMetadata::bad_request(
                    "InvalidLimit",
                    format!("limit must be positive, got {limit}"),
                )),
                Some(limit) => (limit as usize).min(*common::knobs::API_LIMIT_MAX),
                None => *common::knobs::DEFAULT_PAGE_SIZE,
            };
            let deleted_clause = if ctx.show_deleted() {
                ""
            } else {
                "AND deleted = 0"
            };
            let mut params: Vec<Value> = vec![Value::Text(member.clone())];
            let marker_clause = match marker {
                Some(marker_id) => {
                    let marker_row = get_member(connection, &ctx, marker_id)?;
                    params.push(Value::Integer(to_nanos(marker_row.created_at)));
                    params.push(Value::Integer(to_nanos(marker_row.created_at)));
                    params.push(Value::Integer(marker_row.id));
                    "AND (created_at < ?2 OR (created_at = ?3 AND id < ?4))"
                },
                None => "",
            };
            let query = format!(
                "SELECT {MEMBER_COLUMNS} FROM image_members WHERE member = ?1 {deleted_clause} \
                 {marker_clause} ORDER BY created_at DESC, id DESC LIMIT {limit}"
            );
            let mut stmt = connection.prepare(&query)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), member_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(member_from_row).collect()
        })
        .await
    }

    /// Set-difference tag replacement: add what's missing, soft-delete the
    /// extras, leave the intersection untouched.
    pub async fn image_tag_set_all(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
        tags: &BTreeSet<String>,
    ) -> anyhow::Result<()> {
        let ctx = ctx.clone();
        let image_id = image_id.clone();
        let tags = tags.clone();
        self.with_retries("image_tag_set_all", move |inner| {
            let now = self.next_timestamp(inner);
            let tx = inner
                .connection
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let image = load_image(&tx, &ctx, &image_id, false)?;
            visibility::check_mutate_authorization(&ctx, &image)?;

            for tag in tags.difference(&image.tags) {
                tx.execute(INSERT_TAG, params![image_id.as_str(), tag, now, now])?;
            }
            for tag in image.tags.difference(&tags) {
                tx.execute(SOFT_DELETE_TAG, params![now, now, image_id.as_str(), tag])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn image_tag_get_all(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
    ) -> anyhow::Result<BTreeSet<String>> {
        let image = self.image_get(ctx, image_id, false).await?;
        Ok(image.tags)
    }

    pub async fn image_tag_create(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
        tag: &str,
    ) -> anyhow::Result<()> {
        let ctx = ctx.clone();
        let image_id = image_id.clone();
        let tag = tag.to_owned();
        self.with_retries("image_tag_create", move |inner| {
            let now = self.next_timestamp(inner);
            let tx = inner
                .connection
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let image = load_image(&tx, &ctx, &image_id, false)?;
            visibility::check_mutate_authorization(&ctx, &image)?;
            let inserted = tx.execute(INSERT_TAG, params![image_id.as_str(), tag, now, now]);
            if let Err(e) = inserted {
                if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
                    anyhow::bail!(ErrorMetadata::conflict(
                        "TagAlreadyExists",
                        format!("Image {image_id} already carries tag '{tag}'"),
                    ));
                }
                return Err(e.into());
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn image_tag_delete(
        &self,
        ctx: &RequestContext,
        image_id: &ImageId,
        tag: &str,
    ) -> anyhow::Result<()> {
        let ctx = ctx.clone();
        let image_id = image_id.clone();
        let tag = tag.to_owned();
        self.with_retries("image_tag_delete", move |inner| {
            let now = self.next_timestamp(inner);
            let tx = inner
                .connection
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            let image = load_image(&tx, &ctx, &image_id, false)?;
            visibility::check_mutate_authorization(&ctx, &image)?;
            let changed = tx.execute(SOFT_DELETE_TAG, params![now, now, image_id.as_str(), tag])?;
            if changed == 0 {
                anyhow::bail!(ErrorMetadata::not_found(
                    "TagNotFound",
                    format!("Image {image_id} carries no tag '{tag}'"),
                ));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

/// An operational error recognizable as a lost connection. The retriable
/// code list is configuration so new backends can extend it.
fn is_transient(e: &anyhow::Error) -> bool {
    let Some(sqlite_error) = e.downcast_ref::<rusqlite::Error>() else {
        return false;
    };
    match sqlite_error {
        rusqlite::Error::SqliteFailure(inner, _) => {
            let primary = inner.extended_code & 0xff;
            DB_RETRIABLE_ERROR_CODES.contains(&primary)
                || DB_RETRIABLE_ERROR_CODES.contains(&inner.extended_code)
        },
        _ => false,
    }
}

fn guard_deletable(image: &Image) -> anyhow::Result<()> {
    if image.protected {
        anyhow::bail!(ErrorMetadata::protected_image_delete(image.id.as_str()));
    }
    if image.deleted {
        anyhow::bail!(ErrorMetadata::forbidden(
            "ImageDeleted",
            format!("Image {} is already deleted", image.id),
        ));
    }
    Ok(())
}

fn not_found(id: &ImageId) -> anyhow::Error {
    ErrorMetadata::not_found("ImageNotFound", format!("No image found with ID {id}")).into()
}

/// Raw image columns before children are attached.
struct ImageRow {
    id: String,
    name: Option<String>,
    status: String,
    disk_format: Option<String>,
    container_format: Option<String>,
    size: i64,
    checksum: Option<String>,
    min_disk: i64,
    min_ram: i64,
    owner: Option<String>,
    is_public: bool,
    protected: bool,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
    deleted: bool,
}

const IMAGE_COLUMNS: &str = "id, name, status, disk_format, container_format, size, checksum, \
                             min_disk, min_ram, owner, is_public, protected, created_at, \
                             updated_at, deleted_at, deleted";

fn image_row(row: &Row<'_>) -> rusqlite::Result<ImageRow> {
    Ok(ImageRow {
        id: row.get(0)?,
        name: row.get(1)?,
        status: row.get(2)?,
        disk_format: row.get(3)?,
        container_format: row.get(4)?,
        size: row.get(5)?,
        checksum: row.get(6)?,
        min_disk: row.get(7)?,
        min_ram: row.get(8)?,
        owner: row.get(9)?,
        is_public: row.get(10)?,
        protected: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        deleted_at: row.get(14)?,
        deleted: row.get(15)?,
    })
}

fn hydrate_image(connection: &Connection, raw: ImageRow) -> anyhow::Result<Image> {
    let id = ImageId::from(raw.id.clone());

    let mut stmt = connection.prepare_cached(SELECT_PROPERTIES)?;
    let properties = stmt
        .query_map(params![raw.id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(name, value)| (name, value.unwrap_or_default()))
        .collect::<BTreeMap<_, _>>();

    let mut stmt = connection.prepare_cached(SELECT_TAGS)?;
    let tags = stmt
        .query_map(params![raw.id], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;

    let mut stmt = connection.prepare_cached(SELECT_LOCATIONS)?;
    let locations = stmt
        .query_map(params![raw.id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(url, metadata, status)| {
            anyhow::Ok(ImageLocation {
                url,
                metadata: serde_json::from_str(&metadata)?,
                status: LocationStatus::from_str(&status)
                    .map_err(|_| anyhow::anyhow!("Unknown location status {status:?}"))?,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut stmt = connection.prepare_cached(SELECT_MEMBERS)?;
    let members = stmt
        .query_map(params![raw.id], member_row)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(member_from_row)
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Image {
        id,
        name: raw.name,
        status: ImageStatus::from_str(&raw.status)
            .map_err(|_| anyhow::anyhow!("Unknown image status {:?}", raw.status))?,
        disk_format: raw
            .disk_format
            .as_deref()
            .map(common::types::DiskFormat::from_str)
            .transpose()
            .map_err(|_| anyhow::anyhow!("Unknown disk format"))?,
        container_format: raw
            .container_format
            .as_deref()
            .map(common::types::ContainerFormat::from_str)
            .transpose()
            .map_err(|_| anyhow::anyhow!("Unknown container format"))?,
        size: raw.size as u64,
        checksum: raw.checksum,
        min_disk: raw.min_disk as u64,
        min_ram: raw.min_ram as u64,
        owner: raw.owner,
        is_public: raw.is_public,
        protected: raw.protected,
        created_at: from_nanos(raw.created_at),
        updated_at: from_nanos(raw.updated_at),
        deleted_at: raw.deleted_at.map(from_nanos),
        deleted: raw.deleted,
        properties,
        tags,
        locations,
        members,
    })
}

/// Fetch an image with children eagerly loaded, enforcing the soft-delete
/// filter and visibility. Absence and invisibility raise the same NotFound
/// so existence never leaks.
fn load_image(
    connection: &Connection,
    ctx: &RequestContext,
    id: &ImageId,
    force_show_deleted: bool,
) -> anyhow::Result<Image> {
    let mut stmt = connection.prepare_cached(SELECT_IMAGE)?;
    let raw = stmt
        .query_map(params![id.as_str()], image_row)?
        .next()
        .transpose()?
        .ok_or_else(|| not_found(id))?;
    if raw.deleted && !force_show_deleted && !ctx.show_deleted() {
        return Err(not_found(id));
    }
    let image = hydrate_image(connection, raw)?;
    if !visibility::is_image_visible(ctx, &image) {
        return Err(not_found(id));
    }
    Ok(image)
}

type MemberRow = (i64, String, String, bool, String, i64, i64, bool);

fn member_row(row: &Row<'_>) -> rusqlite::Result<MemberRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn member_from_row(row: MemberRow) -> anyhow::Result<ImageMember> {
    let (id, image_id, member, can_share, status, created_at, updated_at, deleted) = row;
    Ok(ImageMember {
        id,
        image_id: ImageId::from(image_id),
        member,
        can_share,
        status: MemberStatus::from_str(&status)
            .map_err(|_| anyhow::anyhow!("Unknown member status {status:?}"))?,
        created_at: from_nanos(created_at),
        updated_at: from_nanos(updated_at),
        deleted,
    })
}

fn find_member(
    connection: &Connection,
    ctx: &RequestContext,
    image_id: &ImageId,
    member: &str,
) -> anyhow::Result<ImageMember> {
    let deleted_clause = if ctx.show_deleted() {
        ""
    } else {
        "AND deleted = 0"
    };
    let query = format!(
        "SELECT {MEMBER_COLUMNS} FROM image_members WHERE image_id = ?1 AND member = ?2 \
         {deleted_clause} ORDER BY deleted ASC LIMIT 1"
    );
    let mut stmt = connection.prepare(&query)?;
    let row = stmt
        .query_map(params![image_id.as_str(), member], member_row)?
        .next()
        .transpose()?
        .ok_or_else(|| {
            ErrorMetadata::not_found(
                "MemberNotFound",
                format!("No membership found for image {image_id} member {member}"),
            )
        })?;
    member_from_row(row)
}

fn get_member(
    connection: &Connection,
    ctx: &RequestContext,
    member_id: i64,
) -> anyhow::Result<ImageMember> {
    let deleted_clause = if ctx.show_deleted() {
        ""
    } else {
        "AND deleted = 0"
    };
    let query = format!(
        "SELECT {MEMBER_COLUMNS} FROM image_members WHERE id = ?1 {deleted_clause}"
    );
    let mut stmt = connection.prepare(&query)?;
    let row = stmt
        .query_map(params![member_id], member_row)?
        .next()
        .transpose()?
        .ok_or_else(|| {
            ErrorMetadata::not_found(
                "MemberNotFound",
                format!("No membership found with ID {member_id}"),
            )
        })?;
    let member = member_from_row(row)?;
    // The caller must be able to see the image the membership points at.
    load_image(connection, ctx, &member.image_id, ctx.show_deleted())?;
    Ok(member)
}

fn upsert_properties(
    connection: &Connection,
    image_id: &ImageId,
    properties: &BTreeMap<String, String>,
    now: i64,
) -> anyhow::Result<()> {
    let mut stmt = connection.prepare_cached(UPSERT_PROPERTY)?;
    for (name, value) in properties {
        stmt.execute(params![image_id.as_str(), name, value, now, now])?;
    }
    Ok(())
}

fn replace_locations(
    connection: &Connection,
    image_id: &ImageId,
    locations: &[ImageLocation],
    now: i64,
) -> anyhow::Result<()> {
    connection.execute(SOFT_DELETE_LOCATIONS, params![now, now, image_id.as_str()])?;
    let mut stmt = connection.prepare_cached(INSERT_LOCATION)?;
    for (position, location) in locations.iter().enumerate() {
        stmt.execute(params![
            image_id.as_str(),
            location.url,
            serde_json::to_string(&location.metadata)?,
            location.status.to_string(),
            position as i64,
            now,
            now,
        ])?;
    }
    Ok(())
}

fn soft_delete_image(
    connection: &Connection,
    id: &ImageId,
    status: ImageStatus,
    now: i64,
) -> anyhow::Result<()> {
    connection.execute(
        SOFT_DELETE_IMAGE,
        params![status.to_string(), now, now, id.as_str()],
    )?;
    Ok(())
}

fn cascade_soft_delete(connection: &Connection, id: &ImageId, now: i64) -> anyhow::Result<()> {
    connection.execute(SOFT_DELETE_PROPERTIES, params![now, now, id.as_str()])?;
    connection.execute(SOFT_DELETE_TAGS, params![now, now, id.as_str()])?;
    connection.execute(SOFT_DELETE_MEMBERS, params![now, now, id.as_str()])?;
    Ok(())
}

/// The marker row's value for one sort key, in SQL form, so the keyset
/// predicate compares exactly what the ORDER BY sorts.
fn image_sort_value(image: &Image, key: &str) -> Value {
    fn text(value: &Option<String>) -> Value {
        match value {
            Some(v) => Value::Text(v.clone()),
            None => Value::Null,
        }
    }
    match key {
        "id" => Value::Text(image.id.to_string()),
        "name" => text(&image.name),
        "status" => Value::Text(image.status.to_string()),
        "disk_format" => text(&image.disk_format.map(|f| f.to_string())),
        "container_format" => text(&image.container_format.map(|f| f.to_string())),
        "size" => Value::Integer(image.size as i64),
        "checksum" => text(&image.checksum),
        "min_disk" => Value::Integer(image.min_disk as i64),
        "min_ram" => Value::Integer(image.min_ram as i64),
        "owner" => text(&image.owner),
        "is_public" => Value::Integer(image.is_public as i64),
        "protected" => Value::Integer(image.protected as i64),
        "created_at" => Value::Integer(to_nanos(image.created_at)),
        "updated_at" => Value::Integer(to_nanos(image.updated_at)),
        "deleted_at" => match image.deleted_at {
            Some(ts) => Value::Integer(to_nanos(ts)),
            None => Value::Null,
        },
        _ => unreachable!("sort keys are validated before use"),
    }
}

const SELECT_IMAGE: &str = "SELECT id, name, status, disk_format, container_format, size, \
                            checksum, min_disk, min_ram, owner, is_public, protected, \
                            created_at, updated_at, deleted_at, deleted FROM images WHERE id = ?1";

const INSERT_IMAGE: &str = "INSERT INTO images (id, name, status, disk_format, \
                            container_format, size, checksum, min_disk, min_ram, owner, \
                            is_public, protected, created_at, updated_at) VALUES (?1, ?2, ?3, \
                            ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";

const UPDATE_IMAGE: &str = "UPDATE images SET name = ?1, status = ?2, disk_format = ?3, \
                            container_format = ?4, size = ?5, checksum = ?6, min_disk = ?7, \
                            min_ram = ?8, owner = ?9, is_public = ?10, protected = ?11, \
                            updated_at = ?12 WHERE id = ?13";

const UPDATE_IMAGE_STATUS: &str = "UPDATE images SET status = ?1, updated_at = ?2 WHERE id = ?3";

const SOFT_DELETE_IMAGE: &str = "UPDATE images SET status = ?1, deleted = 1, deleted_at = ?2, \
                                 updated_at = ?3 WHERE id = ?4";

const PENDING_SCRUB: &str = "SELECT id FROM images WHERE status = 'pending_delete' AND \
                             deleted_at <= ?1 ORDER BY deleted_at ASC";

const SELECT_PROPERTIES: &str = "SELECT name, value FROM image_properties WHERE image_id = ?1 \
                                 AND deleted = 0";

const UPSERT_PROPERTY: &str = "INSERT INTO image_properties (image_id, name, value, created_at, \
                               updated_at) VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT (image_id, \
                               name) DO UPDATE SET value = excluded.value, updated_at = \
                               excluded.updated_at, deleted = 0, deleted_at = NULL";

const SOFT_DELETE_PROPERTY: &str = "UPDATE image_properties SET deleted = 1, deleted_at = ?1, \
                                    updated_at = ?2 WHERE image_id = ?3 AND name = ?4 AND \
                                    deleted = 0";

const SOFT_DELETE_PROPERTIES: &str = "UPDATE image_properties SET deleted = 1, deleted_at = ?1, \
                                      updated_at = ?2 WHERE image_id = ?3 AND deleted = 0";

const SELECT_TAGS: &str =
    "SELECT value FROM image_tags WHERE image_id = ?1 AND deleted = 0 ORDER BY value ASC";

const INSERT_TAG: &str = "INSERT INTO image_tags (image_id, value, created_at, updated_at) \
                          VALUES (?1, ?2, ?3, ?4)";

const SOFT_DELETE_TAG: &str = "UPDATE image_tags SET deleted = 1, deleted_at = ?1, updated_at = \
                               ?2 WHERE image_id = ?3 AND value = ?4 AND deleted = 0";

const SOFT_DELETE_TAGS: &str = "UPDATE image_tags SET deleted = 1, deleted_at = ?1, updated_at \
                                = ?2 WHERE image_id = ?3 AND deleted = 0";

const SELECT_LOCATIONS: &str = "SELECT url, metadata, status FROM image_locations WHERE \
                                image_id = ?1 AND deleted = 0 ORDER BY position ASC";

const INSERT_LOCATION: &str = "INSERT INTO image_locations (image_id, url, metadata, status, \
                               position, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, \
                               ?6, ?7)";

const SOFT_DELETE_LOCATIONS: &str = "UPDATE image_locations SET deleted = 1, deleted_at = ?1, \
                                     updated_at = ?2 WHERE image_id = ?3 AND deleted = 0";

const UPDATE_LOCATION_STATUS_ALL: &str = "UPDATE image_locations SET status = ?1, updated_at = \
                                          ?2 WHERE image_id = ?3 AND deleted = 0";

const MEMBER_COLUMNS: &str =
    "id, image_id, member, can_share, status, created_at, updated_at, deleted";

const SELECT_MEMBERS: &str = "SELECT id, image_id, member, can_share, status, created_at, \
                              updated_at, deleted FROM image_members WHERE image_id = ?1 AND \
                              deleted = 0 ORDER BY created_at ASC";

const INSERT_MEMBER: &str = "INSERT INTO image_members (image_id, member, can_share, status, \
                             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const UPDATE_MEMBER: &str = "UPDATE image_members SET can_share = ?1, status = ?2, deleted = 0, \
                             deleted_at = NULL, updated_at = ?3 WHERE id = ?4";

const SOFT_DELETE_MEMBER: &str = "UPDATE image_members SET deleted = 1, deleted_at = ?1, \
                                  updated_at = ?2 WHERE id = ?3 AND deleted = 0";

const SOFT_DELETE_MEMBERS: &str = "UPDATE image_members SET deleted = 1, deleted_at = ?1, \
                                   updated_at = ?2 WHERE image_id = ?3 AND deleted = 0";
