// 🔎 Attribute Predicates - Where clauses as data
// Rendered to parameterized SQL for the backend, evaluated in memory for map selections

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// FIELD VALUES
// ============================================================================

/// A single attribute value as stored in the geodatabase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Real(r) => Some(*r),
            _ => None,
        }
    }

    /// Equality with the loose typing SQLite applies between columns and literals.
    /// NULL never equals anything.
    pub fn loosely_eq(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Null, _) | (_, FieldValue::Null) => false,
            (FieldValue::Text(a), FieldValue::Text(b)) => a == b,
            (FieldValue::Text(t), n) | (n, FieldValue::Text(t)) => {
                match (t.trim().parse::<f64>().ok(), n.as_number()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            (a, b) => a.as_number() == b.as_number(),
        }
    }

    /// Text content with surrounding spaces removed, as SQL `TRIM()` does.
    fn trimmed_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            other => Some(other.to_string().trim_matches(' ').to_string()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Real(r) if r.fract() == 0.0 && r.abs() < 1e15 => write!(f, "{}", *r as i64),
            FieldValue::Real(r) => write!(f, "{}", r),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Integer(i)
    }
}

impl From<ValueRef<'_>> for FieldValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => FieldValue::Null,
            ValueRef::Integer(i) => FieldValue::Integer(i),
            ValueRef::Real(r) => FieldValue::Real(r),
            ValueRef::Text(t) => FieldValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => FieldValue::Text(format!("<{} bytes>", b.len())),
        }
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::Owned(Value::Null),
            FieldValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            FieldValue::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            FieldValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

static NULL: FieldValue = FieldValue::Null;

/// One row of attributes keyed by field name.
pub type Record = BTreeMap<String, FieldValue>;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// True for plain SQL identifiers: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double-quote an identifier for SQL, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ============================================================================
// PREDICATE
// ============================================================================

/// A where clause. Literals are always bound as parameters.
///
/// Both renderings use SQL three-valued logic: a comparison against NULL is
/// unknown, `NOT unknown` stays unknown, and only a true result selects a row.
/// A change with a NULL building type therefore fails `NOT (type IN ...)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Always(bool),
    IsNull(String),
    Eq(String, FieldValue),
    In(String, Vec<FieldValue>),
    /// `TRIM(field) IN (...)`
    TrimmedIn(String, Vec<String>),
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

/// SQL text plus the values bound to its `?` placeholders, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlClause {
    pub sql: String,
    pub params: Vec<FieldValue>,
}

impl Predicate {
    pub fn is_null(field: &str) -> Self {
        Predicate::IsNull(field.to_string())
    }

    pub fn eq(field: &str, value: impl Into<FieldValue>) -> Self {
        Predicate::Eq(field.to_string(), value.into())
    }

    /// Membership test. An empty value list becomes a constant false, never `IN ()`.
    pub fn in_list(field: &str, values: Vec<FieldValue>) -> Self {
        if values.is_empty() {
            Predicate::Always(false)
        } else {
            Predicate::In(field.to_string(), values)
        }
    }

    pub fn trimmed_in(field: &str, values: Vec<String>) -> Self {
        if values.is_empty() {
            Predicate::Always(false)
        } else {
            Predicate::TrimmedIn(field.to_string(), values)
        }
    }

    pub fn not(inner: Predicate) -> Self {
        Predicate::Not(Box::new(inner))
    }

    /// Render to SQL with `?` placeholders.
    pub fn to_sql(&self) -> SqlClause {
        let mut params = Vec::new();
        let sql = self.render(&mut params);
        SqlClause { sql, params }
    }

    fn render(&self, params: &mut Vec<FieldValue>) -> String {
        match self {
            Predicate::Always(true) => "1".to_string(),
            Predicate::Always(false) => "0".to_string(),
            Predicate::IsNull(field) => format!("{} IS NULL", quote_ident(field)),
            Predicate::Eq(field, value) => {
                params.push(value.clone());
                format!("{} = ?", quote_ident(field))
            }
            Predicate::In(field, values) => {
                params.extend(values.iter().cloned());
                format!("{} IN ({})", quote_ident(field), placeholders(values.len()))
            }
            Predicate::TrimmedIn(field, values) => {
                params.extend(values.iter().map(|v| FieldValue::Text(v.clone())));
                format!("TRIM({}) IN ({})", quote_ident(field), placeholders(values.len()))
            }
            Predicate::Not(inner) => format!("NOT ({})", inner.render(params)),
            Predicate::And(parts) => join_parts(parts, " AND ", "1", params),
            Predicate::Or(parts) => join_parts(parts, " OR ", "0", params),
        }
    }

    /// Evaluate against an in-memory record. Missing fields read as NULL.
    /// Selects only when the result is true, as a SQL `WHERE` does.
    pub fn matches(&self, record: &Record) -> bool {
        self.eval(record) == Some(true)
    }

    /// Three-valued evaluation; `None` is SQL's unknown.
    fn eval(&self, record: &Record) -> Option<bool> {
        let get = |field: &str| record.get(field).unwrap_or(&NULL);
        match self {
            Predicate::Always(b) => Some(*b),
            Predicate::IsNull(field) => Some(get(field).is_null()),
            Predicate::Eq(field, value) => {
                let actual = get(field);
                if actual.is_null() || value.is_null() {
                    None
                } else {
                    Some(actual.loosely_eq(value))
                }
            }
            Predicate::In(field, values) => {
                let actual = get(field);
                if actual.is_null() {
                    None
                } else if values.iter().any(|v| actual.loosely_eq(v)) {
                    Some(true)
                } else if values.iter().any(FieldValue::is_null) {
                    None
                } else {
                    Some(false)
                }
            }
            Predicate::TrimmedIn(field, values) => {
                let text = get(field).trimmed_text()?;
                Some(values.iter().any(|v| *v == text))
            }
            Predicate::Not(inner) => inner.eval(record).map(|b| !b),
            Predicate::And(parts) => {
                let mut result = Some(true);
                for part in parts {
                    match part.eval(record) {
                        Some(false) => return Some(false),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                result
            }
            Predicate::Or(parts) => {
                let mut result = Some(false);
                for part in parts {
                    match part.eval(record) {
                        Some(true) => return Some(true),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                result
            }
        }
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn join_parts(parts: &[Predicate], sep: &str, empty: &str, params: &mut Vec<FieldValue>) -> String {
    if parts.is_empty() {
        return empty.to_string();
    }
    let rendered: Vec<String> = parts.iter().map(|p| format!("({})", p.render(params))).collect();
    rendered.join(sep)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, FieldValue)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_empty_in_list_is_constant_false() {
        let p = Predicate::in_list("PIN", vec![]);
        assert_eq!(p, Predicate::Always(false));
        assert_eq!(p.to_sql().sql, "0");
        assert!(p.to_sql().params.is_empty());
    }

    #[test]
    fn test_quotes_in_values_are_bound_not_interpolated() {
        let p = Predicate::in_list("PIN", vec!["O'BRIEN-1".into(), "A2".into()]);
        let clause = p.to_sql();

        assert_eq!(clause.sql, "\"PIN\" IN (?, ?)");
        assert!(!clause.sql.contains("O'BRIEN"));
        assert_eq!(clause.params[0], FieldValue::Text("O'BRIEN-1".into()));
    }

    #[test]
    fn test_not_renders_plain_negation() {
        let p = Predicate::And(vec![
            Predicate::is_null("IN_SDE"),
            Predicate::not(Predicate::eq("isDemolition", 1i64)),
        ]);
        let clause = p.to_sql();

        assert_eq!(
            clause.sql,
            "(\"IN_SDE\" IS NULL) AND (NOT (\"isDemolition\" = ?))"
        );
        assert_eq!(clause.params, vec![FieldValue::Integer(1)]);
    }

    #[test]
    fn test_trimmed_in_matches_after_trimming_spaces() {
        let p = Predicate::trimmed_in("Type", vec!["C320 - INDUSTRIAL".into()]);

        assert!(p.matches(&record(&[("Type", "  C320 - INDUSTRIAL ".into())])));
        assert!(!p.matches(&record(&[("Type", "c320 - industrial".into())])));
        assert!(!p.matches(&record(&[("Type", FieldValue::Null)])));
    }

    #[test]
    fn test_not_of_null_comparison_rejects_row() {
        let p = Predicate::not(Predicate::trimmed_in("Type", vec!["C213 - HOTEL/MOTEL".into()]));
        assert!(!p.matches(&record(&[("Type", FieldValue::Null)])));
        assert!(!p.matches(&Record::new()));
        assert!(p.matches(&record(&[("Type", "GARAGE".into())])));

        let demo = Predicate::not(Predicate::eq("isDemolition", 1i64));
        assert!(!demo.matches(&record(&[("isDemolition", FieldValue::Null)])));
        assert!(demo.matches(&record(&[("isDemolition", FieldValue::Integer(0))])));
    }

    #[test]
    fn test_unknown_is_absorbed_by_decisive_operands() {
        let unknown = Predicate::eq("isDemolition", 1i64);
        let hotel = Predicate::trimmed_in("Type", vec!["C213 - HOTEL/MOTEL".into()]);
        let row = record(&[("Type", "C213 - HOTEL/MOTEL".into()), ("isDemolition", FieldValue::Null)]);

        // excluded type OR unknown demolition is still true, so the NOT is false
        let either = Predicate::Or(vec![hotel.clone(), unknown.clone()]);
        assert!(either.matches(&row));
        assert!(!Predicate::not(either).matches(&row));

        // unknown AND false is false, negated it selects
        let other = record(&[("Type", "GARAGE".into()), ("isDemolition", FieldValue::Null)]);
        let both = Predicate::And(vec![hotel, unknown]);
        assert!(Predicate::not(both).matches(&other));
    }

    #[test]
    fn test_sql_and_memory_agree_on_null_rows() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE c (Type TEXT, isDemolition INTEGER);
             INSERT INTO c VALUES (NULL, 0), ('GARAGE', NULL), ('GARAGE', 0), (' C213 - HOTEL/MOTEL', 0);",
        )
        .unwrap();
        let p = Predicate::And(vec![
            Predicate::not(Predicate::trimmed_in("Type", vec!["C213 - HOTEL/MOTEL".into()])),
            Predicate::not(Predicate::eq("isDemolition", 1i64)),
        ]);
        let clause = p.to_sql();

        let sql = format!("SELECT Type, isDemolition FROM c WHERE {} ORDER BY rowid", clause.sql);
        let mut stmt = conn.prepare(&sql).unwrap();
        let selected: Vec<Record> = stmt
            .query_map(rusqlite::params_from_iter(clause.params.iter()), |row| {
                Ok(record(&[
                    ("Type", FieldValue::from(row.get_ref(0)?)),
                    ("isDemolition", FieldValue::from(row.get_ref(1)?)),
                ]))
            })
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0]["Type"], FieldValue::Text("GARAGE".into()));
        assert!(selected.iter().all(|r| p.matches(r)));
    }

    #[test]
    fn test_loose_equality_between_text_and_numbers() {
        assert!(FieldValue::Integer(1042).loosely_eq(&"1042".into()));
        assert!(FieldValue::Real(7.0).loosely_eq(&FieldValue::Integer(7)));
        assert!(!FieldValue::Null.loosely_eq(&FieldValue::Null));
        assert!(!FieldValue::Text("A1".into()).loosely_eq(&FieldValue::Integer(1)));
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("ParcelNumber"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("PIN; DROP TABLE"));
        assert!(!is_identifier(""));
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_display_of_whole_reals_has_no_fraction() {
        assert_eq!(FieldValue::Real(12345.0).to_string(), "12345");
        assert_eq!(FieldValue::Real(1.5).to_string(), "1.5");
        assert_eq!(FieldValue::Null.to_string(), "");
    }
}
