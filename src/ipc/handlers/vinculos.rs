use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{require_i64, require_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Every mutation on the aluno/ano bindings carries the shared admin
/// secret; on mismatch nothing is written.
fn check_admin(state: &AppState, req: &Request) -> Result<(), HandlerErr> {
    let supplied = req
        .params
        .get("adminSecret")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    match state.admin_secret.as_deref() {
        Some(expected) if !supplied.is_empty() && supplied == expected => Ok(()),
        _ => Err(HandlerErr::new(
            "admin_forbidden",
            "Código de admin inválido.",
        )),
    }
}

fn vinculo_json(
    conn: &Connection,
    aluno: &str,
    ano: i64,
) -> Result<serde_json::Value, HandlerErr> {
    let row: Option<(String, i64, String)> = conn
        .query_row(
            "SELECT aluno, ano, serie FROM aluno_ano WHERE aluno = ? AND ano = ?",
            (aluno, ano),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let Some((aluno, ano, serie)) = row else {
        return Err(HandlerErr::new("not_found", "vínculo not found"));
    };
    Ok(json!({ "aluno": aluno, "ano": ano, "serie": serie }))
}

fn handle_vinculos_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn
        .prepare("SELECT aluno, ano, serie FROM aluno_ano ORDER BY ano DESC, aluno ASC")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "aluno": r.get::<_, String>(0)?,
                "ano": r.get::<_, i64>(1)?,
                "serie": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(vinculos) => ok(&req.id, json!({ "vinculos": vinculos })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_vinculos_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = check_admin(state, req) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let aluno = match require_str(&req.params, "aluno") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let ano = match require_i64(&req.params, "ano") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let serie = match require_str(&req.params, "serie") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO aluno_ano(id, aluno, ano, serie) VALUES(?, ?, ?, ?)
         ON CONFLICT(aluno, ano) DO UPDATE SET serie = excluded.serie",
        (&id, &aluno, ano, &serie),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "aluno_ano" })),
        );
    }

    match vinculo_json(conn, &aluno, ano) {
        Ok(vinculo) => ok(&req.id, json!({ "vinculo": vinculo })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_vinculos_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = check_admin(state, req) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let aluno = match require_str(&req.params, "aluno") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let ano = match require_i64(&req.params, "ano") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match conn.execute(
        "DELETE FROM aluno_ano WHERE aluno = ? AND ano = ?",
        (&aluno, ano),
    ) {
        Ok(n) => ok(&req.id, json!({ "deleted": n })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "vinculos.list" => Some(handle_vinculos_list(state, req)),
        "vinculos.upsert" => Some(handle_vinculos_upsert(state, req)),
        "vinculos.delete" => Some(handle_vinculos_delete(state, req)),
        _ => None,
    }
}
