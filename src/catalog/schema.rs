//! The bootstrap schema. `CREATE TABLE IF NOT EXISTS` only — there is no
//! versioning or migration step, by design (the spec calls schema
//! *lifecycle* out of scope, not the tables themselves).

pub const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS filesystem (
    id   INTEGER PRIMARY KEY,
    uuid BLOB NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS volume (
    id                        INTEGER PRIMARY KEY,
    fs_id                     INTEGER NOT NULL REFERENCES filesystem(id),
    root_id                   INTEGER NOT NULL,
    size_cutoff               INTEGER NOT NULL,
    last_tracked_generation   INTEGER NOT NULL DEFAULT 0,
    last_tracked_size_cutoff  INTEGER,
    UNIQUE(fs_id, root_id)
);

CREATE TABLE IF NOT EXISTS volume_path_history (
    vol_id INTEGER NOT NULL REFERENCES volume(id),
    path   TEXT NOT NULL,
    UNIQUE(vol_id, path)
);

-- No foreign key to anything: inode numbers are recycled by the
-- filesystem, identity lives entirely in (vol_id, ino).
CREATE TABLE IF NOT EXISTS inode (
    vol_id       INTEGER NOT NULL,
    ino          INTEGER NOT NULL,
    size         INTEGER NOT NULL,
    has_updates  INTEGER NOT NULL DEFAULT 1,
    mini_hash    BLOB,
    fiemap_hash  BLOB,
    PRIMARY KEY (vol_id, ino)
);

CREATE INDEX IF NOT EXISTS inode_size_idx ON inode(size) WHERE has_updates = 1;

-- Audit log. No FK to `inode` on purpose, see the module doc comment.
CREATE TABLE IF NOT EXISTS dedup_event (
    id        INTEGER PRIMARY KEY,
    fs_id     INTEGER NOT NULL,
    item_size INTEGER NOT NULL,
    created   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dedup_event_inode (
    id       INTEGER PRIMARY KEY,
    event_id INTEGER NOT NULL REFERENCES dedup_event(id),
    ino      INTEGER NOT NULL,
    vol_id   INTEGER NOT NULL
);
"#;
