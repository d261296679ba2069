use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{require_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn aluno_json(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    let row: Option<(String, String, String, i64)> = conn
        .query_row(
            "SELECT id, nome, serie, ativo FROM alunos WHERE id = ?",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let Some((id, nome, serie, ativo)) = row else {
        return Err(HandlerErr::new("not_found", "aluno not found"));
    };
    Ok(json!({ "id": id, "nome": nome, "serie": serie, "ativo": ativo != 0 }))
}

fn handle_alunos_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn
        .prepare("SELECT id, nome, serie, ativo FROM alunos ORDER BY ativo DESC, nome ASC")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "nome": r.get::<_, String>(1)?,
                "serie": r.get::<_, String>(2)?,
                "ativo": r.get::<_, i64>(3)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(alunos) => ok(&req.id, json!({ "alunos": alunos })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_alunos_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let nome = match require_str(&req.params, "nome") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let serie = match require_str(&req.params, "serie") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO alunos(id, nome, serie, ativo) VALUES(?, ?, ?, 1)",
        (&id, &nome, &serie),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "alunos" })),
        );
    }

    match aluno_json(conn, &id) {
        Ok(aluno) => ok(&req.id, json!({ "aluno": aluno })),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "alunos.list" => Some(handle_alunos_list(state, req)),
        "alunos.create" => Some(handle_alunos_create(state, req)),
        _ => None,
    }
}
