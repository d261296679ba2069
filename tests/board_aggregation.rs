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

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn add_row(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    seq: &mut u32,
    disciplina: &str,
    avaliacao: &str,
    valor_max: serde_json::Value,
    nota: Option<serde_json::Value>,
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
    *seq += 1;
    request_ok(
        stdin,
        reader,
        &format!("label-{}", seq),
        "notas.updateField",
        json!({ "id": id, "field": "avaliacao", "value": avaliacao }),
    );
    *seq += 1;
    request_ok(
        stdin,
        reader,
        &format!("max-{}", seq),
        "notas.updateField",
        json!({ "id": id, "field": "valorMax", "value": valor_max }),
    );
    if let Some(n) = nota {
        *seq += 1;
        request_ok(
            stdin,
            reader,
            &format!("nota-{}", seq),
            "notas.updateField",
            json!({ "id": id, "field": "nota", "value": n }),
        );
    }
    id
}

#[test]
fn board_thresholds_cumulatives_and_blanking() {
    let workspace = temp_dir("notasd-board");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let mut seq = 0;
    let _a1 = add_row(
        &mut stdin,
        &mut reader,
        &mut seq,
        "Matemática",
        "A1",
        json!(10),
        Some(json!(6)),
    );
    // Comma decimals go through the same parser as the operator's text.
    let a2 = add_row(
        &mut stdin,
        &mut reader,
        &mut seq,
        "Matemática",
        "A2",
        json!("10,0"),
        None,
    );

    let board = request_ok(
        &mut stdin,
        &mut reader,
        "board-1",
        "notas.board",
        json!({ "aluno": "Miguel", "ano": 2025, "etapa": 1 }),
    );
    assert_eq!(board.get("budget").and_then(|v| v.as_f64()), Some(30.0));

    let subjects = board
        .get("subjects")
        .and_then(|v| v.as_array())
        .expect("subjects array");
    assert_eq!(subjects.len(), 1);
    let subject = &subjects[0];
    assert_eq!(
        subject.get("disciplina").and_then(|v| v.as_str()),
        Some("Matemática")
    );

    let rows = subject
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("rows array");
    assert_eq!(rows.len(), 2);

    let r1 = &rows[0];
    assert_eq!(r1.get("avaliacao").and_then(|v| v.as_str()), Some("A1"));
    assert_eq!(
        r1.get("rowPassThreshold").and_then(|v| v.as_f64()),
        Some(6.0)
    );
    assert_eq!(r1.get("belowRow").and_then(|v| v.as_bool()), Some(false));
    let cum = r1.get("cumulative").expect("graded row has cumulative");
    assert_eq!(cum.get("score").and_then(|v| v.as_f64()), Some(6.0));
    assert_eq!(cum.get("passThreshold").and_then(|v| v.as_f64()), Some(6.0));
    assert_eq!(cum.get("below").and_then(|v| v.as_bool()), Some(false));

    let r2 = &rows[1];
    assert_eq!(r2.get("avaliacao").and_then(|v| v.as_str()), Some("A2"));
    assert!(r2.get("nota").map(|v| v.is_null()).unwrap_or(true));
    assert!(
        r2.get("cumulative").is_none(),
        "ungraded row must keep cumulative columns blank"
    );

    let summary = subject.get("summary").expect("subject summary");
    assert_eq!(summary.get("sumMax").and_then(|v| v.as_f64()), Some(20.0));
    assert_eq!(summary.get("diff").and_then(|v| v.as_f64()), Some(10.0));

    // Unsaved edits override persisted values without writing anything.
    let board2 = request_ok(
        &mut stdin,
        &mut reader,
        "board-2",
        "notas.board",
        json!({
            "aluno": "Miguel", "ano": 2025, "etapa": 1,
            "edits": [{ "id": a2, "nota": "8" }]
        }),
    );
    let rows2 = board2
        .get("subjects")
        .and_then(|v| v.as_array())
        .and_then(|s| s[0].get("rows"))
        .and_then(|v| v.as_array())
        .expect("rows");
    let cum2 = rows2[1].get("cumulative").expect("edited row has cumulative");
    assert_eq!(cum2.get("score").and_then(|v| v.as_f64()), Some(14.0));
    assert_eq!(
        cum2.get("passThreshold").and_then(|v| v.as_f64()),
        Some(12.0)
    );

    // The edit never reached the store.
    let board3 = request_ok(
        &mut stdin,
        &mut reader,
        "board-3",
        "notas.board",
        json!({ "aluno": "Miguel", "ano": 2025, "etapa": 1 }),
    );
    let rows3 = board3
        .get("subjects")
        .and_then(|v| v.as_array())
        .and_then(|s| s[0].get("rows"))
        .and_then(|v| v.as_array())
        .expect("rows");
    assert!(rows3[1].get("cumulative").is_none());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn board_orders_labels_naturally_and_flags_below() {
    let workspace = temp_dir("notasd-board-order");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let mut seq = 0;
    add_row(
        &mut stdin,
        &mut reader,
        &mut seq,
        "Ciências",
        "A10",
        json!(10),
        Some(json!(5.9)),
    );
    add_row(
        &mut stdin,
        &mut reader,
        &mut seq,
        "Ciências",
        "A2",
        json!(10),
        Some(json!(6.0)),
    );

    let board = request_ok(
        &mut stdin,
        &mut reader,
        "board-1",
        "notas.board",
        json!({ "aluno": "Miguel", "ano": 2025, "etapa": 1 }),
    );
    let rows = board
        .get("subjects")
        .and_then(|v| v.as_array())
        .and_then(|s| s[0].get("rows"))
        .and_then(|v| v.as_array())
        .expect("rows");
    let labels: Vec<&str> = rows
        .iter()
        .map(|r| r.get("avaliacao").and_then(|v| v.as_str()).unwrap_or(""))
        .collect();
    assert_eq!(labels, vec!["A2", "A10"], "A2 sorts before A10");

    // A10 scored 5.9 against a 6.0 bar.
    let a10 = rows
        .iter()
        .find(|r| r.get("avaliacao").and_then(|v| v.as_str()) == Some("A10"))
        .expect("A10 row");
    assert_eq!(a10.get("belowRow").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
