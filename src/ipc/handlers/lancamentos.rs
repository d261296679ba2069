use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{decimal_from_value, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;

const LIST_DEFAULT_LIMIT: i64 = 20;
const LIST_MAX_LIMIT: i64 = 200;

fn lancamento_json(r: &Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "aluno": r.get::<_, String>(1)?,
        "serie": r.get::<_, String>(2)?,
        "etapa": r.get::<_, i64>(3)?,
        "disciplina": r.get::<_, String>(4)?,
        "avaliacao": r.get::<_, String>(5)?,
        "valorMax": r.get::<_, f64>(6)?,
        "valorMedia": r.get::<_, f64>(7)?,
        "nota": r.get::<_, Option<f64>>(8)?,
        "criadoEm": r.get::<_, String>(9)?,
    }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(LIST_DEFAULT_LIMIT)
        .clamp(1, LIST_MAX_LIMIT);

    let mut stmt = match conn.prepare(
        "SELECT id, aluno, serie, etapa, disciplina, avaliacao, valor_max, valor_media, nota, criado_em
         FROM notas_lancamentos ORDER BY id DESC LIMIT ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([limit], lancamento_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(lancamentos) => ok(&req.id, json!({ "lancamentos": lancamentos })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// The legacy single-form submission path, with its full validation:
/// this is the only place valor_media is stored rather than derived.
fn validate_and_insert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<i64, HandlerErr> {
    let text = |key: &str| -> String {
        params
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string()
    };
    let aluno = text("aluno");
    let serie = text("serie");
    let disciplina = text("disciplina");
    let avaliacao = text("avaliacao");
    if aluno.is_empty() || serie.is_empty() || disciplina.is_empty() || avaliacao.is_empty() {
        return Err(HandlerErr::bad_params(
            "Campos obrigatórios: aluno, serie, disciplina, avaliacao",
        ));
    }

    let etapa = params.get("etapa").and_then(|v| v.as_i64()).unwrap_or(0);
    if calc::term_budget(etapa).is_none() {
        return Err(HandlerErr::bad_params("Etapa inválida (1,2,3)"));
    }

    let valor_max = decimal_from_value(
        params.get("valorMax").unwrap_or(&serde_json::Value::Null),
        "valorMax",
    )
    .ok()
    .flatten()
    .unwrap_or(f64::NAN);
    if !valor_max.is_finite() || valor_max <= 0.0 {
        return Err(HandlerErr::bad_params("valor_max inválido"));
    }

    let valor_media = match params.get("valorMedia") {
        None | Some(serde_json::Value::Null) => {
            // Default: 60% of the maximum, kept to two decimals.
            (valor_max * 0.6 * 100.0).round() / 100.0
        }
        Some(v) => decimal_from_value(v, "valorMedia")
            .ok()
            .flatten()
            .unwrap_or(f64::NAN),
    };
    if !valor_media.is_finite() || valor_media < 0.0 {
        return Err(HandlerErr::bad_params("valor_media inválido"));
    }

    let nota = match params.get("nota") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => match decimal_from_value(v, "nota") {
            Ok(n) => n,
            Err(_) => return Err(HandlerErr::bad_params("nota inválida")),
        },
    };
    if let Some(n) = nota {
        if n < 0.0 || n > valor_max {
            return Err(HandlerErr::bad_params("nota fora do intervalo"));
        }
    }

    let criado_em = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO notas_lancamentos(aluno, serie, etapa, disciplina, avaliacao, valor_max, valor_media, nota, criado_em)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &aluno,
            &serie,
            etapa,
            &disciplina,
            &avaliacao,
            valor_max,
            valor_media,
            nota,
            &criado_em,
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "notas_lancamentos" }))
    })?;

    Ok(conn.last_insert_rowid())
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let id = match validate_and_insert(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let row = conn
        .query_row(
            "SELECT id, aluno, serie, etapa, disciplina, avaliacao, valor_max, valor_media, nota, criado_em
             FROM notas_lancamentos WHERE id = ?",
            [id],
            lancamento_json,
        )
        .optional();
    match row {
        Ok(Some(lancamento)) => ok(&req.id, json!({ "lancamento": lancamento })),
        Ok(None) => err(&req.id, "not_found", "lançamento not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "lancamentos.list" => Some(handle_list(state, req)),
        "lancamentos.create" => Some(handle_create(state, req)),
        _ => None,
    }
}
