/// SQL DDL for the keel database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    session_count INTEGER NOT NULL DEFAULT 0,
    total_lines INTEGER NOT NULL DEFAULT 0,
    average_velocity REAL NOT NULL DEFAULT 0.0,
    completion_rate REAL NOT NULL DEFAULT 0.0,
    common_blockers TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    project TEXT NOT NULL,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    phase TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    is_active INTEGER NOT NULL DEFAULT 1,
    scope_lines INTEGER NOT NULL,
    scope_tests INTEGER NOT NULL DEFAULT 0,
    scope_docs INTEGER NOT NULL DEFAULT 0,
    context_budget INTEGER NOT NULL,
    context_used INTEGER NOT NULL DEFAULT 0,
    continuing_from TEXT,
    lines_written INTEGER NOT NULL DEFAULT 0,
    tests_written INTEGER NOT NULL DEFAULT 0,
    docs_written INTEGER NOT NULL DEFAULT 0,
    velocity_score REAL NOT NULL DEFAULT 0.0,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    number INTEGER NOT NULL,
    tokens_used INTEGER NOT NULL,
    completed_components TEXT NOT NULL,
    metrics TEXT NOT NULL,
    message TEXT,
    continuation TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (session_id, number)
);

CREATE TABLE IF NOT EXISTS context_usage (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    phase TEXT NOT NULL,
    tokens INTEGER NOT NULL,
    operation TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reality_snapshots (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    focus_areas TEXT NOT NULL,
    confidence REAL NOT NULL,
    discrepancies TEXT NOT NULL,
    recommendations TEXT NOT NULL,
    checked_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS applied_fixes (
    snapshot_id TEXT NOT NULL REFERENCES reality_snapshots(id) ON DELETE CASCADE,
    discrepancy_id TEXT NOT NULL,
    outcome TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    PRIMARY KEY (snapshot_id, discrepancy_id)
);

CREATE TABLE IF NOT EXISTS blockers (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    description TEXT NOT NULL,
    impact REAL NOT NULL,
    resolution TEXT,
    resolved_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documentations (
    id TEXT PRIMARY KEY,
    session_id TEXT REFERENCES sessions(id) ON DELETE SET NULL,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    doc_type TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (project_id, path)
);

CREATE TABLE IF NOT EXISTS agent_memory (
    id TEXT PRIMARY KEY,
    agent TEXT NOT NULL,
    action TEXT NOT NULL,
    session_id TEXT REFERENCES sessions(id) ON DELETE CASCADE,
    input TEXT NOT NULL,
    decision TEXT NOT NULL,
    success INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS symbol_registry (
    id TEXT PRIMARY KEY,
    project TEXT NOT NULL,
    concept TEXT NOT NULL,
    name TEXT NOT NULL,
    context_type TEXT NOT NULL,
    confidence REAL NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 1,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    UNIQUE (project, concept, name)
);

CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id);
CREATE INDEX IF NOT EXISTS idx_sessions_active ON sessions(is_active);
CREATE INDEX IF NOT EXISTS idx_checkpoints_session ON checkpoints(session_id, number);
CREATE INDEX IF NOT EXISTS idx_usage_session ON context_usage(session_id, recorded_at);
CREATE INDEX IF NOT EXISTS idx_snapshots_session ON reality_snapshots(session_id);
CREATE INDEX IF NOT EXISTS idx_blockers_project ON blockers(project_id);
CREATE INDEX IF NOT EXISTS idx_docs_project ON documentations(project_id);
CREATE INDEX IF NOT EXISTS idx_memory_session ON agent_memory(session_id, action);
CREATE INDEX IF NOT EXISTS idx_symbols_project ON symbol_registry(project, concept);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
