use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE: &str = "notas.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS alunos(
            id TEXT PRIMARY KEY,
            nome TEXT NOT NULL UNIQUE,
            serie TEXT NOT NULL,
            ativo INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS aluno_ano(
            id TEXT PRIMARY KEY,
            aluno TEXT NOT NULL,
            ano INTEGER NOT NULL,
            serie TEXT NOT NULL,
            UNIQUE(aluno, ano)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_aluno_ano_ano ON aluno_ano(ano)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS etapas(
            id INTEGER PRIMARY KEY,
            nome TEXT NOT NULL,
            valor_total REAL NOT NULL,
            ordem INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notas(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ano INTEGER NOT NULL,
            aluno TEXT NOT NULL,
            etapa INTEGER NOT NULL,
            disciplina TEXT NOT NULL,
            avaliacao TEXT NOT NULL,
            tipo TEXT NOT NULL DEFAULT 'regular',
            valor_max REAL NOT NULL DEFAULT 0,
            nota REAL,
            obs TEXT,
            criado_em TEXT NOT NULL
        )",
        [],
    )?;

    // Older workspaces predate the explicit tipo column and the obs field.
    ensure_notas_tipo(&conn)?;
    ensure_notas_obs(&conn)?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notas_aluno_ano ON notas(aluno, ano)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notas_contexto ON notas(aluno, ano, etapa)",
        [],
    )?;
    // At most one ajuste row per subject and term context.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_notas_ajuste_unico
         ON notas(aluno, ano, etapa, disciplina) WHERE tipo = 'ajuste'",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notas_lancamentos(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            aluno TEXT NOT NULL,
            serie TEXT NOT NULL,
            etapa INTEGER NOT NULL,
            disciplina TEXT NOT NULL,
            avaliacao TEXT NOT NULL,
            valor_max REAL NOT NULL,
            valor_media REAL NOT NULL,
            nota REAL,
            criado_em TEXT NOT NULL
        )",
        [],
    )?;

    seed_etapas(&conn)?;

    Ok(conn)
}

fn ensure_notas_tipo(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "notas", "tipo")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE notas ADD COLUMN tipo TEXT NOT NULL DEFAULT 'regular'",
        [],
    )?;
    // Pre-tipo workspaces flagged the balancing row through its label.
    conn.execute(
        "UPDATE notas SET tipo = 'ajuste' WHERE lower(trim(avaliacao)) = 'ajuste'",
        [],
    )?;
    Ok(())
}

fn ensure_notas_obs(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "notas", "obs")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE notas ADD COLUMN obs TEXT", [])?;
    Ok(())
}

/// The etapa catalog is display data with fixed totals; reseeding on
/// every open is a no-op once the rows exist.
fn seed_etapas(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO etapas(id, nome, valor_total, ordem) VALUES
            (1, '1ª Etapa', 30, 1),
            (2, '2ª Etapa', 30, 2),
            (3, '3ª Etapa', 40, 3)",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
