use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_notasd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn notasd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        id,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        id,
        value
    );
    value.get("error").cloned().expect("error body")
}

fn add_scored(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    seq: &mut u32,
    disciplina: &str,
    avaliacao: &str,
    valor_max: f64,
    nota: Option<f64>,
) -> i64 {
    *seq += 1;
    let created = request_ok(
        stdin,
        reader,
        &format!("add-{}", seq),
        "notas.add",
        json!({ "aluno": "Miguel", "ano": 2025, "etapa": 1, "disciplina": disciplina }),
    );
    let id = created
        .get("nota")
        .and_then(|n| n.get("id"))
        .and_then(|v| v.as_i64())
        .expect("created nota id");
    for (field, value) in [
        ("avaliacao", json!(avaliacao)),
        ("valorMax", json!(valor_max)),
        ("nota", nota.map(|n| json!(n)).unwrap_or(serde_json::Value::Null)),
    ] {
        *seq += 1;
        request_ok(
            stdin,
            reader,
            &format!("upd-{}", seq),
            "notas.updateField",
            json!({ "id": id, "field": field, "value": value }),
        );
    }
    id
}

fn ajuste_rows(workspace: &PathBuf) -> Vec<(i64, f64)> {
    let conn = Connection::open(workspace.join("notas.sqlite3")).expect("open db");
    let mut stmt = conn
        .prepare("SELECT id, valor_max FROM notas WHERE tipo = 'ajuste' ORDER BY id")
        .expect("prepare");
    stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("collect")
}

#[test]
fn close_creates_then_converges_then_guards_budget() {
    let workspace = temp_dir("notasd-close");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let mut seq = 0;
    add_scored(
        &mut stdin,
        &mut reader,
        &mut seq,
        "Matemática",
        "A1",
        10.0,
        Some(6.0),
    );
    add_scored(
        &mut stdin,
        &mut reader,
        &mut seq,
        "Matemática",
        "A2",
        10.0,
        None,
    );

    // Shortfall of 10 creates the ajuste row.
    let closed = request_ok(
        &mut stdin,
        &mut reader,
        "close-1",
        "notas.closeTotal",
        json!({ "aluno": "Miguel", "ano": 2025, "etapa": 1, "disciplina": "Matemática" }),
    );
    assert_eq!(closed.get("action").and_then(|v| v.as_str()), Some("created"));
    let ajuste = closed.get("nota").expect("ajuste row");
    assert_eq!(ajuste.get("tipo").and_then(|v| v.as_str()), Some("ajuste"));
    assert_eq!(
        ajuste.get("avaliacao").and_then(|v| v.as_str()),
        Some("Ajuste")
    );
    assert_eq!(ajuste.get("valorMax").and_then(|v| v.as_f64()), Some(10.0));
    assert!(ajuste.get("nota").map(|v| v.is_null()).unwrap_or(true));

    // Second close converges on the same value and never duplicates.
    let closed2 = request_ok(
        &mut stdin,
        &mut reader,
        "close-2",
        "notas.closeTotal",
        json!({ "aluno": "Miguel", "ano": 2025, "etapa": 1, "disciplina": "Matemática" }),
    );
    assert_eq!(
        closed2.get("action").and_then(|v| v.as_str()),
        Some("updated")
    );
    assert_eq!(
        closed2
            .get("nota")
            .and_then(|n| n.get("valorMax"))
            .and_then(|v| v.as_f64()),
        Some(10.0)
    );
    let rows = ajuste_rows(&workspace);
    assert_eq!(rows.len(), 1, "exactly one ajuste row per subject");
    assert_eq!(rows[0].1, 10.0);

    // Push the subject over budget: 10 + 10 + 25 = 45 > 30.
    add_scored(
        &mut stdin,
        &mut reader,
        &mut seq,
        "Matemática",
        "A3",
        25.0,
        None,
    );
    let error = request_err(
        &mut stdin,
        &mut reader,
        "close-3",
        "notas.closeTotal",
        json!({ "aluno": "Miguel", "ano": 2025, "etapa": 1, "disciplina": "Matemática" }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("budget_exceeded")
    );
    assert_eq!(
        error
            .get("details")
            .and_then(|d| d.get("excedente"))
            .and_then(|v| v.as_f64()),
        Some(15.0)
    );
    let message = error.get("message").and_then(|v| v.as_str()).unwrap_or("");
    assert!(
        message.contains("Matemática"),
        "refusal names the subject: {}",
        message
    );

    // The refusal wrote nothing.
    let rows = ajuste_rows(&workspace);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, 10.0);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn close_sees_unsaved_edits_and_zero_diff_placeholder() {
    let workspace = temp_dir("notasd-close-edits");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let mut seq = 0;
    let a1 = add_scored(
        &mut stdin,
        &mut reader,
        &mut seq,
        "Ciências",
        "P1",
        12.0,
        Some(9.0),
    );

    // The operator has typed 30 into the max field but not saved it:
    // closing must reconcile against what they see.
    let closed = request_ok(
        &mut stdin,
        &mut reader,
        "close-1",
        "notas.closeTotal",
        json!({
            "aluno": "Miguel", "ano": 2025, "etapa": 1, "disciplina": "Ciências",
            "edits": [{ "id": a1, "valorMax": "30" }]
        }),
    );
    assert_eq!(closed.get("action").and_then(|v| v.as_str()), Some("created"));
    assert_eq!(
        closed
            .get("nota")
            .and_then(|n| n.get("valorMax"))
            .and_then(|v| v.as_f64()),
        Some(0.0),
        "edited max already fills the budget, placeholder stays at zero"
    );

    // Closing an empty subject allocates the whole budget.
    let closed2 = request_ok(
        &mut stdin,
        &mut reader,
        "close-2",
        "notas.closeTotal",
        json!({ "aluno": "Miguel", "ano": 2025, "etapa": 1, "disciplina": "História" }),
    );
    assert_eq!(
        closed2.get("action").and_then(|v| v.as_str()),
        Some("created")
    );
    assert_eq!(
        closed2
            .get("nota")
            .and_then(|n| n.get("valorMax"))
            .and_then(|v| v.as_f64()),
        Some(30.0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
