use crate::calc::{
    self, ClosePlan, EntryKind, NotaRow, Score, ViewContext, AJUSTE_LABEL, DEFAULT_AVALIACAO,
};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    decimal_from_value, opt_str, overlay_from_params, require_i64, require_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;

const NOTA_COLS: &str =
    "id, ano, aluno, etapa, disciplina, avaliacao, tipo, valor_max, nota, obs, criado_em";

fn map_nota_row(r: &Row<'_>) -> rusqlite::Result<NotaRow> {
    Ok(NotaRow {
        id: r.get(0)?,
        ano: r.get(1)?,
        aluno: r.get(2)?,
        etapa: r.get(3)?,
        disciplina: r.get(4)?,
        avaliacao: r.get(5)?,
        kind: EntryKind::from_db(&r.get::<_, String>(6)?),
        valor_max: r.get(7)?,
        nota: Score::from_option(r.get(8)?),
        obs: r.get(9)?,
        criado_em: r.get(10)?,
    })
}

fn nota_json(row: &NotaRow) -> serde_json::Value {
    json!({
        "id": row.id,
        "ano": row.ano,
        "aluno": row.aluno,
        "etapa": row.etapa,
        "disciplina": row.disciplina,
        "avaliacao": row.avaliacao,
        "tipo": row.kind.as_str(),
        "valorMax": row.valor_max,
        "nota": row.nota.to_option(),
        "obs": row.obs,
        "criadoEm": row.criado_em,
    })
}

fn rows_for_context(conn: &Connection, ctx: &ViewContext) -> Result<Vec<NotaRow>, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM notas WHERE aluno = ? AND ano = ? AND etapa = ? ORDER BY id",
        NOTA_COLS
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    stmt.query_map((&ctx.aluno, ctx.ano, ctx.etapa), map_nota_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn rows_for_student(conn: &Connection, aluno: &str, ano: i64) -> Result<Vec<NotaRow>, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM notas WHERE aluno = ? AND ano = ? ORDER BY id",
        NOTA_COLS
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    stmt.query_map((aluno, ano), map_nota_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn fetch_nota(conn: &Connection, id: i64) -> Result<NotaRow, HandlerErr> {
    let sql = format!("SELECT {} FROM notas WHERE id = ?", NOTA_COLS);
    conn.query_row(&sql, [id], map_nota_row)
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| {
            HandlerErr::new("not_found", "nota not found").with_details(json!({ "id": id }))
        })
}

fn resolve_serie(
    conn: &Connection,
    aluno: &str,
    ano: i64,
) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT serie FROM aluno_ano WHERE aluno = ? AND ano = ?",
        (aluno, ano),
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn view_context(req: &Request) -> Result<ViewContext, HandlerErr> {
    let aluno = require_str(&req.params, "aluno")?;
    let ano = require_i64(&req.params, "ano")?;
    let etapa = require_i64(&req.params, "etapa")?;
    if calc::term_budget(etapa).is_none() {
        return Err(HandlerErr::bad_params("etapa must be 1, 2 or 3"));
    }
    Ok(ViewContext { aluno, ano, etapa })
}

fn handle_board(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let ctx = match view_context(req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let overlay = match overlay_from_params(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let serie = match resolve_serie(conn, &ctx.aluno, ctx.ano) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let rows = match rows_for_context(conn, &ctx) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match calc::build_board(&ctx, serie, rows, &overlay) {
        Ok(board) => ok(
            &req.id,
            serde_json::to_value(board).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let ctx = match view_context(req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let disciplina = opt_str(&req.params, "disciplina").unwrap_or_default();

    let criado_em = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO notas(ano, aluno, etapa, disciplina, avaliacao, tipo, valor_max, nota, obs, criado_em)
         VALUES(?, ?, ?, ?, ?, 'regular', 0, NULL, NULL, ?)",
        (ctx.ano, &ctx.aluno, ctx.etapa, &disciplina, DEFAULT_AVALIACAO, &criado_em),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "notas" })),
        );
    }

    let id = conn.last_insert_rowid();
    match fetch_nota(conn, id) {
        Ok(row) => ok(&req.id, json!({ "nota": nota_json(&row) })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_update_field(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let id = match require_i64(&req.params, "id") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let field = match require_str(&req.params, "field") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let row = match fetch_nota(conn, id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let value = req.params.get("value").cloned().unwrap_or(serde_json::Value::Null);

    let result = match field.as_str() {
        "avaliacao" => {
            // Renaming never changes the row's kind; "Ajuste" is just text.
            match value.as_str().map(str::trim) {
                Some(label) if !label.is_empty() => conn
                    .execute("UPDATE notas SET avaliacao = ? WHERE id = ?", (label, id))
                    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string())),
                _ => Err(HandlerErr::bad_params("value must be a non-empty string")),
            }
        }
        "obs" => {
            let obs: Option<String> = match &value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) if s.trim().is_empty() => None,
                serde_json::Value::String(s) => Some(s.trim().to_string()),
                _ => {
                    return HandlerErr::bad_params("value must be a string or null")
                        .response(&req.id)
                }
            };
            conn.execute("UPDATE notas SET obs = ? WHERE id = ?", (&obs, id))
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))
        }
        "valorMax" => match decimal_from_value(&value, "valorMax") {
            // A cleared maximum commits as zero, like the display overlay.
            Ok(v) => {
                let v = calc::number_or_zero(v);
                if v < 0.0 {
                    Err(HandlerErr::bad_params("valorMax must be >= 0"))
                } else {
                    conn.execute("UPDATE notas SET valor_max = ? WHERE id = ?", (v, id))
                        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))
                }
            }
            Err(e) => Err(e),
        },
        "nota" => match decimal_from_value(&value, "nota") {
            Ok(v) => {
                if let Some(x) = v {
                    if x < 0.0 || x > row.valor_max {
                        return HandlerErr::bad_params(
                            "Nota precisa estar entre 0 e o Valor Máx.",
                        )
                        .with_details(json!({ "nota": x, "valorMax": row.valor_max }))
                        .response(&req.id);
                    }
                }
                conn.execute("UPDATE notas SET nota = ? WHERE id = ?", (v, id))
                    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))
            }
            Err(e) => Err(e),
        },
        other => Err(HandlerErr::bad_params(format!("unknown field: {}", other))),
    };

    if let Err(e) = result {
        return e.response(&req.id);
    }

    match fetch_nota(conn, id) {
        Ok(updated) => ok(&req.id, json!({ "nota": nota_json(&updated) })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let id = match require_i64(&req.params, "id") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match conn.execute("DELETE FROM notas WHERE id = ?", [id]) {
        Ok(0) => err(
            &req.id,
            "not_found",
            "nota not found",
            Some(json!({ "id": id })),
        ),
        Ok(_) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

fn handle_close_total(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let ctx = match view_context(req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let disciplina = match req.params.get("disciplina").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing disciplina", None),
    };
    let overlay = match overlay_from_params(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    // view_context already vetted the etapa.
    let budget = calc::term_budget(ctx.etapa).unwrap_or_default();

    let subject = calc::subject_key(&disciplina);
    let rows: Vec<NotaRow> = match rows_for_context(conn, &ctx) {
        Ok(v) => v
            .into_iter()
            .filter(|r| calc::subject_key(&r.disciplina) == subject)
            .collect(),
        Err(e) => return e.response(&req.id),
    };

    let plan = match calc::close_total(&subject, &rows, &overlay, budget) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let (action, id) = match plan {
        ClosePlan::Update { id, valor_max } => {
            if let Err(e) = conn.execute(
                "UPDATE notas SET valor_max = ? WHERE id = ?",
                (valor_max, id),
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
            ("updated", id)
        }
        ClosePlan::Insert { valor_max } => {
            let criado_em = Utc::now().to_rfc3339();
            if let Err(e) = conn.execute(
                "INSERT INTO notas(ano, aluno, etapa, disciplina, avaliacao, tipo, valor_max, nota, obs, criado_em)
                 VALUES(?, ?, ?, ?, ?, 'ajuste', ?, NULL, NULL, ?)",
                (
                    ctx.ano,
                    &ctx.aluno,
                    ctx.etapa,
                    &disciplina,
                    AJUSTE_LABEL,
                    valor_max,
                    &criado_em,
                ),
            ) {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "notas" })),
                );
            }
            ("created", conn.last_insert_rowid())
        }
    };

    match fetch_nota(conn, id) {
        Ok(row) => ok(
            &req.id,
            json!({ "action": action, "nota": nota_json(&row) }),
        ),
        Err(e) => e.response(&req.id),
    }
}

fn handle_smart_etapa(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    match rows_for_student(conn, &aluno, ano) {
        Ok(rows) => ok(&req.id, json!({ "etapa": calc::smart_term(&rows) })),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notas.board" => Some(handle_board(state, req)),
        "notas.add" => Some(handle_add(state, req)),
        "notas.updateField" => Some(handle_update_field(state, req)),
        "notas.delete" => Some(handle_delete(state, req)),
        "notas.closeTotal" => Some(handle_close_total(state, req)),
        "notas.smartEtapa" => Some(handle_smart_etapa(state, req)),
        _ => None,
    }
}
