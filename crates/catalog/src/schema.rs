use rusqlite::Connection;

/// Forward-only migrations, identified by integer versions tracked in
/// `PRAGMA user_version`. Never edit a shipped script; append a new one.
const MIGRATIONS: &[&str] = &[INITIAL_SCHEMA, LISTING_INDEXES, LIVE_CHILD_UNIQUENESS];

const INITIAL_SCHEMA: &str = r#"
CREATE TABLE images (
    id TEXT NOT NULL,

    name TEXT NULL,
    status TEXT NOT NULL,
    disk_format TEXT NULL,
    container_format TEXT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    checksum TEXT NULL,
    min_disk INTEGER NOT NULL DEFAULT 0,
    min_ram INTEGER NOT NULL DEFAULT 0,
    owner TEXT NULL,
    is_public INTEGER NOT NULL DEFAULT 0,
    protected INTEGER NOT NULL DEFAULT 0,

    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER NULL,
    deleted INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (id)
);

CREATE TABLE image_properties (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id TEXT NOT NULL REFERENCES images (id),

    name TEXT NOT NULL,
    value TEXT NULL,

    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER NULL,
    deleted INTEGER NOT NULL DEFAULT 0,

    UNIQUE (image_id, name)
);

CREATE TABLE image_tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id TEXT NOT NULL REFERENCES images (id),

    value TEXT NOT NULL,

    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE image_locations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id TEXT NOT NULL REFERENCES images (id),

    url TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'active',
    position INTEGER NOT NULL DEFAULT 0,

    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE image_members (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id TEXT NOT NULL REFERENCES images (id),

    member TEXT NOT NULL,
    can_share INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',

    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER NULL,
    deleted INTEGER NOT NULL DEFAULT 0,

    UNIQUE (image_id, member, deleted_at)
);
"#;

const LISTING_INDEXES: &str = r#"
CREATE INDEX images_by_owner ON images (owner, deleted);
CREATE INDEX images_by_status ON images (status, deleted_at);
CREATE INDEX images_by_updated_at ON images (updated_at);
CREATE INDEX image_properties_by_image ON image_properties (image_id, name);
CREATE INDEX image_members_by_member ON image_members (member, deleted);
"#;

/// The UNIQUE constraint on (image_id, member, deleted_at) does not constrain
/// live rows, since NULL deleted_at values never compare equal. These partial
/// indexes do.
const LIVE_CHILD_UNIQUENESS: &str = r#"
CREATE UNIQUE INDEX image_members_live
    ON image_members (image_id, member) WHERE deleted = 0;
CREATE UNIQUE INDEX image_tags_live
    ON image_tags (image_id, value) WHERE deleted = 0;
"#;

/// Bring the database up to the current schema version. Each script runs in
/// its own transaction with the version bump, so a crash mid-migration
/// leaves a cleanly resumable database.
pub fn migrate(connection: &mut Connection) -> anyhow::Result<()> {
    let current: u32 = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    for (version, script) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let tx = connection.transaction()?;
        tx.execute_batch(script)?;
        tx.pragma_update(None, "user_version", version as u32 + 1)?;
        tx.commit()?;
        tracing::info!("Applied catalog migration {}", version + 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::migrate;

    #[test]
    fn test_migrations_are_idempotent() -> anyhow::Result<()> {
        let mut connection = Connection::open_in_memory()?;
        migrate(&mut connection)?;
        let version: u32 =
            connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
        assert_eq!(version as usize, super::MIGRATIONS.len());
        // A second run must be a no-op.
        migrate(&mut connection)?;
        Ok(())
    }
}
