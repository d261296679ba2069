use serde::Serialize;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Label given to rows the Term Closer creates. Display text only; the
/// business fact lives in `EntryKind`.
pub const AJUSTE_LABEL: &str = "Ajuste";
pub const DEFAULT_AVALIACAO: &str = "Nova avaliação";
pub const SEM_DISCIPLINA: &str = "(Sem disciplina)";

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Score {
    Ungraded,
    Graded(f64),
}

impl Score {
    pub fn from_option(v: Option<f64>) -> Self {
        match v {
            Some(x) if x.is_finite() => Score::Graded(x),
            _ => Score::Ungraded,
        }
    }

    pub fn to_option(self) -> Option<f64> {
        match self {
            Score::Graded(v) => Some(v),
            Score::Ungraded => None,
        }
    }

    pub fn is_graded(self) -> bool {
        matches!(self, Score::Graded(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Ajuste,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Regular => "regular",
            EntryKind::Ajuste => "ajuste",
        }
    }

    /// Unknown values read back as Regular; only 'ajuste' is special.
    pub fn from_db(s: &str) -> Self {
        if s.eq_ignore_ascii_case("ajuste") {
            EntryKind::Ajuste
        } else {
            EntryKind::Regular
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotaRow {
    pub id: i64,
    pub ano: i64,
    pub aluno: String,
    pub etapa: i64,
    pub disciplina: String,
    pub avaliacao: String,
    pub kind: EntryKind,
    pub valor_max: f64,
    pub nota: Score,
    pub obs: Option<String>,
    pub criado_em: String,
}

/// The currently selected (student, year, term). Threaded explicitly
/// through queries and mutations instead of living in ambient state.
#[derive(Debug, Clone, Serialize)]
pub struct ViewContext {
    pub aluno: String,
    pub ano: i64,
    pub etapa: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EditPatch {
    /// Outer None = no in-progress edit; inner None = field cleared.
    pub valor_max: Option<Option<f64>>,
    pub nota: Option<Score>,
}

/// Unsaved in-progress edits keyed by record id. Overrides the persisted
/// values for display and for closing; never persisted itself.
#[derive(Debug, Clone, Default)]
pub struct EditOverlay {
    by_id: HashMap<i64, EditPatch>,
}

impl EditOverlay {
    pub fn set_valor_max(&mut self, id: i64, v: Option<f64>) {
        self.by_id.entry(id).or_default().valor_max = Some(v);
    }

    pub fn set_nota(&mut self, id: i64, s: Score) {
        self.by_id.entry(id).or_default().nota = Some(s);
    }

    pub fn effective_max(&self, row: &NotaRow) -> f64 {
        match self.by_id.get(&row.id).and_then(|p| p.valor_max) {
            Some(edited) => number_or_zero(edited),
            None => number_or_zero(Some(row.valor_max)),
        }
    }

    pub fn effective_nota(&self, row: &NotaRow) -> Score {
        match self.by_id.get(&row.id).and_then(|p| p.nota) {
            Some(edited) => edited,
            None => row.nota,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Locale-tolerant decimal parsing. With a comma present, dots are
/// thousands separators ("1.234,5" -> 1234.5); without one, the dot is
/// the decimal point ("8.500" -> 8.5). Blank input means "unset".
pub fn parse_decimal(text: &str) -> Option<f64> {
    let t = text.trim();
    if t.is_empty() {
        return None;
    }
    let parsed = if t.contains(',') {
        t.replace('.', "").replace(',', ".").parse::<f64>()
    } else {
        t.parse::<f64>()
    };
    match parsed {
        Ok(v) if v.is_finite() => Some(v),
        _ => None,
    }
}

/// Nearest 0.1, half away from zero on the x10 scale.
pub fn round1(n: f64) -> f64 {
    (n * 10.0).round() / 10.0
}

pub fn format1(n: f64) -> String {
    format!("{:.1}", round1(n))
}

pub fn number_or_zero(v: Option<f64>) -> f64 {
    match v {
        Some(x) if x.is_finite() => x,
        _ => 0.0,
    }
}

/// Fixed per-term point budgets. Closed mapping; no API changes it.
pub fn term_budget(etapa: i64) -> Option<f64> {
    match etapa {
        1 | 2 => Some(30.0),
        3 => Some(40.0),
        _ => None,
    }
}

pub fn subject_key(disciplina: &str) -> String {
    let t = disciplina.trim();
    if t.is_empty() {
        SEM_DISCIPLINA.to_string()
    } else {
        t.to_string()
    }
}

/// Alphanumeric label comparison: digit runs compare numerically, so
/// "A2" sorts before "A10". Case-insensitive on the letter parts.
pub fn compare_alphanum(a: &str, b: &str) -> Ordering {
    let av: Vec<char> = a.chars().collect();
    let bv: Vec<char> = b.chars().collect();
    let mut i = 0;
    let mut j = 0;
    while i < av.len() && j < bv.len() {
        if av[i].is_ascii_digit() && bv[j].is_ascii_digit() {
            let si = i;
            while i < av.len() && av[i].is_ascii_digit() {
                i += 1;
            }
            let sj = j;
            while j < bv.len() && bv[j].is_ascii_digit() {
                j += 1;
            }
            let da: String = av[si..i].iter().collect();
            let db: String = bv[sj..j].iter().collect();
            let ta = da.trim_start_matches('0');
            let tb = db.trim_start_matches('0');
            let ord = ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb));
            if ord != Ordering::Equal {
                return ord;
            }
        } else {
            let ca = av[i].to_lowercase().next().unwrap_or(av[i]);
            let cb = bv[j].to_lowercase().next().unwrap_or(bv[j]);
            if ca != cb {
                return ca.cmp(&cb);
            }
            i += 1;
            j += 1;
        }
    }
    (av.len() - i).cmp(&(bv.len() - j))
}

/// Ajuste rows always sort last; everything else by label, with
/// creation timestamp then id as stable tie-breaks.
pub fn sort_subject_rows(rows: &mut [NotaRow]) {
    rows.sort_by(|a, b| {
        let ka = (a.kind == EntryKind::Ajuste) as u8;
        let kb = (b.kind == EntryKind::Ajuste) as u8;
        ka.cmp(&kb)
            .then_with(|| compare_alphanum(&a.avaliacao, &b.avaliacao))
            .then_with(|| a.criado_em.cmp(&b.criado_em))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Partition rows into per-subject groups, each internally ordered,
/// groups ordered by subject name.
pub fn group_by_subject(rows: Vec<NotaRow>) -> Vec<(String, Vec<NotaRow>)> {
    let mut groups: Vec<(String, Vec<NotaRow>)> = Vec::new();
    for row in rows {
        let key = subject_key(&row.disciplina);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, bucket)) => bucket.push(row),
            None => groups.push((key, vec![row])),
        }
    }
    for (_, bucket) in groups.iter_mut() {
        sort_subject_rows(bucket);
    }
    groups.sort_by(|(a, _), (b, _)| compare_alphanum(a, b));
    groups
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CumulativeFigures {
    pub pass_threshold: f64,
    pub score: f64,
    pub below: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowFigures {
    pub id: i64,
    pub valor_max: f64,
    pub nota: Option<f64>,
    pub row_pass_threshold: f64,
    pub below_row: bool,
    /// Absent (not zero) while the row itself is ungraded, so pending
    /// rows never imply cumulative progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cumulative: Option<CumulativeFigures>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSummary {
    pub sum_max: f64,
    pub diff: f64,
}

/// Per-row figures for one subject's ordered rows, edit-aware. The
/// cumulative subset at row i is the prefix 0..=i restricted to rows
/// whose effective score is present.
pub fn aggregate_subject(rows: &[NotaRow], overlay: &EditOverlay) -> Vec<RowFigures> {
    let mut cum_threshold = 0.0;
    let mut cum_score = 0.0;
    rows.iter()
        .map(|row| {
            let max = overlay.effective_max(row);
            let nota = overlay.effective_nota(row);
            let row_pass = round1(max * 0.6);
            if let Score::Graded(v) = nota {
                cum_threshold += row_pass;
                cum_score += v;
            }
            let below_row = matches!(nota, Score::Graded(v) if v < row_pass - EPS);
            let cumulative = match nota {
                Score::Graded(_) => {
                    let pass_threshold = round1(cum_threshold);
                    let score = round1(cum_score);
                    Some(CumulativeFigures {
                        pass_threshold,
                        score,
                        below: score < pass_threshold - EPS,
                    })
                }
                Score::Ungraded => None,
            };
            RowFigures {
                id: row.id,
                valor_max: max,
                nota: nota.to_option(),
                row_pass_threshold: row_pass,
                below_row,
                cumulative,
            }
        })
        .collect()
}

pub fn subject_summary(rows: &[NotaRow], overlay: &EditOverlay, budget: f64) -> SubjectSummary {
    let sum: f64 = rows.iter().map(|r| overlay.effective_max(r)).sum();
    SubjectSummary {
        sum_max: round1(sum),
        diff: round1(budget - sum),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClosePlan {
    /// Rewrite the existing ajuste row's maximum (possibly to exactly 0;
    /// the row is never deleted automatically).
    Update { id: i64, valor_max: f64 },
    Insert { valor_max: f64 },
}

/// Reconcile one subject's maxima against the term budget via a single
/// ajuste entry. Refuses when the non-ajuste rows already overshoot.
/// The written value is the raw diff: rounding it would manufacture a
/// surplus on the next close.
pub fn close_total(
    disciplina: &str,
    rows: &[NotaRow],
    overlay: &EditOverlay,
    budget: f64,
) -> Result<ClosePlan, CalcError> {
    let ajuste = rows.iter().find(|r| r.kind == EntryKind::Ajuste);
    let sum_sem_ajuste: f64 = rows
        .iter()
        .filter(|r| r.kind != EntryKind::Ajuste)
        .map(|r| overlay.effective_max(r))
        .sum();

    let mut diff = budget - sum_sem_ajuste;
    if diff < -EPS {
        let excedente = round1(-diff);
        return Err(CalcError::new(
            "budget_exceeded",
            format!(
                "Disciplina \"{}\" já passa do total da etapa em {} pontos.",
                disciplina,
                format1(excedente)
            ),
        )
        .with_details(json!({ "disciplina": disciplina, "excedente": excedente })));
    }
    if diff.abs() < EPS {
        diff = 0.0;
    }

    Ok(match ajuste {
        Some(r) => ClosePlan::Update {
            id: r.id,
            valor_max: diff,
        },
        None => ClosePlan::Insert { valor_max: diff },
    })
}

/// Landing term for a (student, year): the earliest term still holding
/// an ungraded regular row, with term 3 as the unconditional fallback.
pub fn smart_term(rows: &[NotaRow]) -> i64 {
    if rows.is_empty() {
        return 1;
    }
    let incomplete = |etapa: i64| {
        rows.iter()
            .any(|r| r.etapa == etapa && r.kind == EntryKind::Regular && !r.nota.is_graded())
    };
    if incomplete(1) {
        1
    } else if incomplete(2) {
        2
    } else {
        3
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectBoard {
    pub disciplina: String,
    pub rows: Vec<BoardRow>,
    pub summary: SubjectSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardRow {
    pub id: i64,
    pub avaliacao: String,
    pub tipo: &'static str,
    pub valor_max: f64,
    pub nota: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obs: Option<String>,
    pub criado_em: String,
    pub row_pass_threshold: f64,
    pub below_row: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cumulative: Option<CumulativeFigures>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardModel {
    pub context: ViewContext,
    pub serie: Option<String>,
    pub budget: f64,
    pub subjects: Vec<SubjectBoard>,
}

pub fn build_board(
    ctx: &ViewContext,
    serie: Option<String>,
    rows: Vec<NotaRow>,
    overlay: &EditOverlay,
) -> Result<BoardModel, CalcError> {
    let Some(budget) = term_budget(ctx.etapa) else {
        return Err(CalcError::new("bad_params", "etapa must be 1, 2 or 3"));
    };

    let subjects = group_by_subject(rows)
        .into_iter()
        .map(|(disciplina, bucket)| {
            let figures = aggregate_subject(&bucket, overlay);
            let summary = subject_summary(&bucket, overlay, budget);
            let rows = bucket
                .iter()
                .zip(figures)
                .map(|(row, f)| BoardRow {
                    id: row.id,
                    avaliacao: row.avaliacao.clone(),
                    tipo: row.kind.as_str(),
                    valor_max: f.valor_max,
                    nota: f.nota,
                    obs: row.obs.clone(),
                    criado_em: row.criado_em.clone(),
                    row_pass_threshold: f.row_pass_threshold,
                    below_row: f.below_row,
                    cumulative: f.cumulative,
                })
                .collect();
            SubjectBoard {
                disciplina,
                rows,
                summary,
            }
        })
        .collect();

    Ok(BoardModel {
        context: ctx.clone(),
        serie,
        budget,
        subjects,
    })
}
