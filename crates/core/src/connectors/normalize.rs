use super::record::{columns_of, FieldValue, Record};
use std::collections::{BTreeMap, HashSet};

/// Make a single column name warehouse-safe, without deduplication
pub fn sanitize_column(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            c
        } else {
            '_'
        };
        // Runs of underscores collapse to one
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches('_');

    if trimmed.is_empty() || trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        format!("c_{}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Sanitize column names and make them unique with `_2`, `_3`, ... suffixes
pub fn sanitize_columns<S: AsRef<str>>(columns: &[S]) -> Vec<String> {
    dedupe(columns.iter().map(|c| sanitize_column(c.as_ref())))
}

fn dedupe(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut used = HashSet::new();
    let mut out = Vec::new();
    for base in names {
        let mut name = base.clone();
        let mut i = 1;
        while used.contains(&name) {
            i += 1;
            name = format!("{}_{}", base, i);
        }
        used.insert(name.clone());
        out.push(name);
    }
    out
}

/// Schema normalization applied to ingested records
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    aliases: BTreeMap<String, String>,
}

impl Normalizer {
    /// `aliases` maps sanitized names to canonical names
    pub fn new(aliases: BTreeMap<String, String>) -> Self {
        Self { aliases }
    }

    /// Final column name for each raw column, in order
    pub fn rename_map<S: AsRef<str>>(&self, columns: &[S]) -> Vec<(String, String)> {
        let renamed = dedupe(columns.iter().map(|c| {
            let sanitized = sanitize_column(c.as_ref());
            self.aliases.get(&sanitized).cloned().unwrap_or(sanitized)
        }));
        columns
            .iter()
            .map(|c| c.as_ref().to_string())
            .zip(renamed)
            .collect()
    }

    /// Rename columns and coerce text values to numbers where they parse
    pub fn normalize(&self, partition: &str, records: Vec<Record>) -> Vec<Record> {
        let columns = columns_of(&records);
        let renames = self.rename_map(&columns);

        let changed: Vec<String> = renames
            .iter()
            .filter(|(raw, new)| raw != new)
            .map(|(raw, new)| format!("{}->{}", raw, new))
            .collect();
        if !changed.is_empty() {
            tracing::info!(
                "Column renames for partition {}: {}",
                partition,
                changed.join("; ")
            );
        }

        let lookup: BTreeMap<&str, &str> = renames
            .iter()
            .map(|(raw, new)| (raw.as_str(), new.as_str()))
            .collect();

        records
            .into_iter()
            .map(|record| {
                record
                    .fields()
                    .map(|(name, value)| {
                        let name = lookup.get(name).copied().unwrap_or(name).to_string();
                        let value = match value {
                            FieldValue::Text(raw) => FieldValue::coerce(raw),
                            other => other.clone(),
                        };
                        (name, value)
                    })
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_column() {
        assert_eq!(sanitize_column("Gross(in $)"), "gross_in");
        assert_eq!(sanitize_column("  Movie Name "), "movie_name");
        assert_eq!(sanitize_column("__rating__"), "rating");
        assert_eq!(sanitize_column("a--b  c"), "a_b_c");
        assert_eq!(sanitize_column("2nd Director"), "c_2nd_director");
        assert_eq!(sanitize_column("$$$"), "c_");
        assert_eq!(sanitize_column("Genre"), "genre");
    }

    #[test]
    fn test_sanitize_columns_dedupes() {
        let columns = sanitize_columns(&["Year", "year", "YEAR ", "Rating"]);
        assert_eq!(columns, vec!["year", "year_2", "year_3", "rating"]);
    }

    #[test]
    fn test_aliases_apply_after_sanitizing() {
        let aliases = BTreeMap::from([("movie_name".to_string(), "title".to_string())]);
        let normalizer = Normalizer::new(aliases);

        let renames = normalizer.rename_map(&["Movie Name", "Title", "Rating"]);
        assert_eq!(
            renames,
            vec![
                ("Movie Name".to_string(), "title".to_string()),
                ("Title".to_string(), "title_2".to_string()),
                ("Rating".to_string(), "rating".to_string()),
            ]
        );
    }

    #[test]
    fn test_normalize_coerces_values() {
        let normalizer = Normalizer::default();
        let raw = Record::new()
            .with("Movie Name", FieldValue::Text("Heat".to_string()))
            .with("Year", FieldValue::Text("1995".to_string()))
            .with("Rating", FieldValue::Text("8.3".to_string()))
            .with("Gross(in $)", FieldValue::Text(String::new()));

        let normalized = normalizer.normalize("crime", vec![raw]);
        assert_eq!(
            normalized[0],
            Record::new()
                .with("movie_name", FieldValue::Text("Heat".to_string()))
                .with("year", FieldValue::Int(1995))
                .with("rating", FieldValue::Float(8.3))
                .with("gross_in", FieldValue::Null)
        );
    }
}
