//! SQLite-dialect schema for the libSQL backend.
//!
//! One consolidated batch, idempotent via `IF NOT EXISTS`. Type conventions:
//! - timestamps -> `TEXT` (RFC 3339, fixed nine-digit fractions, so string
//!   comparison is chronological)
//! - tag/scope sets -> `TEXT` (JSON array)
//! - booleans -> `INTEGER` (0/1)

pub const SCHEMA: &str = r#"

-- ==================== Catalog ====================

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_updated ON tasks(updated_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE TABLE IF NOT EXISTS notes (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    body TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notes_created ON notes(created_at DESC, id DESC);

CREATE TABLE IF NOT EXISTS changelog (
    id TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    summary TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT '',
    actor TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_changelog_created ON changelog(created_at DESC, id DESC);

CREATE TABLE IF NOT EXISTS benchmarks (
    id TEXT PRIMARY KEY,
    workflow TEXT NOT NULL,
    provider_type TEXT NOT NULL,
    provider TEXT NOT NULL DEFAULT '',
    model TEXT NOT NULL,
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0,
    latency_ms INTEGER NOT NULL DEFAULT 0,
    quality_score REAL NOT NULL DEFAULT 0,
    notes TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_benchmarks_created ON benchmarks(created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_benchmarks_segment
    ON benchmarks(workflow, provider_type, provider, model);

-- ==================== Runs & telemetry ====================

CREATE TABLE IF NOT EXISTS agent_runs (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL DEFAULT '',
    workflow TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    prompt_version TEXT NOT NULL DEFAULT '',
    model_policy TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    max_retries INTEGER NOT NULL DEFAULT 0,
    total_attempts INTEGER NOT NULL DEFAULT 0,
    success_attempts INTEGER NOT NULL DEFAULT 0,
    failed_attempts INTEGER NOT NULL DEFAULT 0,
    total_tokens_in INTEGER NOT NULL DEFAULT 0,
    total_tokens_out INTEGER NOT NULL DEFAULT 0,
    total_cost_usd REAL NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    last_error TEXT NOT NULL DEFAULT '',
    started_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_agent_runs_started ON agent_runs(started_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_agent_runs_status ON agent_runs(status);
CREATE INDEX IF NOT EXISTS idx_agent_runs_workflow ON agent_runs(workflow);

CREATE TABLE IF NOT EXISTS prompt_attempts (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES agent_runs(id) ON DELETE CASCADE,
    attempt_number INTEGER NOT NULL,
    workflow TEXT NOT NULL DEFAULT '',
    agent_id TEXT NOT NULL DEFAULT '',
    provider_type TEXT NOT NULL,
    provider TEXT NOT NULL DEFAULT '',
    model TEXT NOT NULL,
    prompt_version TEXT NOT NULL DEFAULT '',
    prompt_hash TEXT NOT NULL DEFAULT '',
    outcome TEXT NOT NULL,
    error_type TEXT NOT NULL DEFAULT '',
    error_message TEXT NOT NULL DEFAULT '',
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0,
    latency_ms INTEGER NOT NULL DEFAULT 0,
    quality_score REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_prompt_attempts_run ON prompt_attempts(run_id);
CREATE INDEX IF NOT EXISTS idx_prompt_attempts_created
    ON prompt_attempts(created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_prompt_attempts_segment
    ON prompt_attempts(workflow, provider_type, provider, model);

CREATE TABLE IF NOT EXISTS run_events (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES agent_runs(id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    data_payload TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id);
CREATE INDEX IF NOT EXISTS idx_run_events_created ON run_events(created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_run_events_type_level ON run_events(event_type, level);

-- ==================== Auth & idempotency ====================

CREATE TABLE IF NOT EXISTS agent_api_keys (
    key_id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    key_hash TEXT NOT NULL UNIQUE,
    scopes TEXT NOT NULL DEFAULT '["tasks:write","telemetry:write","policy:write","admin:read"]',
    is_active INTEGER NOT NULL DEFAULT 1,
    expires_at TEXT,
    revoked_at TEXT,
    last_used_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agent_api_keys_agent ON agent_api_keys(agent_id);
CREATE INDEX IF NOT EXISTS idx_agent_api_keys_active
    ON agent_api_keys(is_active, revoked_at, expires_at);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    method TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    response_payload TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    completed_at TEXT,
    PRIMARY KEY (method, idempotency_key)
);

-- ==================== Policy ====================

CREATE TABLE IF NOT EXISTS orchestration_policy (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    kill_switch INTEGER NOT NULL DEFAULT 0,
    kill_switch_reason TEXT NOT NULL DEFAULT '',
    max_cost_per_run_usd REAL NOT NULL DEFAULT 0,
    max_attempts_per_run INTEGER NOT NULL DEFAULT 0,
    max_tokens_per_run INTEGER NOT NULL DEFAULT 0,
    max_latency_per_attempt_ms INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS policy_caps (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    provider_type TEXT NOT NULL DEFAULT '',
    provider TEXT NOT NULL DEFAULT '',
    model TEXT NOT NULL DEFAULT '',
    max_cost_per_run_usd REAL NOT NULL DEFAULT 0,
    max_attempts_per_run INTEGER NOT NULL DEFAULT 0,
    max_tokens_per_run INTEGER NOT NULL DEFAULT 0,
    max_cost_per_attempt_usd REAL NOT NULL DEFAULT 0,
    max_tokens_per_attempt INTEGER NOT NULL DEFAULT 0,
    max_latency_per_attempt_ms INTEGER NOT NULL DEFAULT 0,
    priority INTEGER NOT NULL DEFAULT 0,
    dry_run INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_policy_caps_priority ON policy_caps(priority DESC, id ASC);

-- ==================== Seed data ====================

-- Policy singleton: one row keyed by a constant id.
INSERT OR IGNORE INTO orchestration_policy (
    id, kill_switch, kill_switch_reason, max_cost_per_run_usd,
    max_attempts_per_run, max_tokens_per_run, max_latency_per_attempt_ms, updated_at
) VALUES (1, 0, '', 0, 0, 0, 0, '1970-01-01T00:00:00.000000000Z');

"#;
