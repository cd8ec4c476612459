use chrono::{DateTime, Utc};
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

pub fn format_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Cut `cell` to at most `max` characters, marking the cut with `…`.
pub fn truncate(cell: &str, max: usize) -> String {
    if cell.chars().count() <= max {
        return cell.to_string();
    }
    let kept: String = cell.chars().take(max.saturating_sub(1)).collect();
    format!("{kept}…")
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Plain-text listing with one line per row. Columns are padded to their
/// widest cell; a column with a limit is truncated to it.
pub struct Table<'a> {
    headers: &'a [&'a str],
    limits: Vec<Option<usize>>,
    rows: Vec<Vec<String>>,
}

impl<'a> Table<'a> {
    pub fn new(headers: &'a [&'a str]) -> Self {
        Self {
            headers,
            limits: vec![None; headers.len()],
            rows: Vec::new(),
        }
    }

    /// Cap column `col` at `max` characters.
    pub fn limit(mut self, col: usize, max: usize) -> Self {
        if let Some(limit) = self.limits.get_mut(col) {
            *limit = Some(max);
        }
        self
    }

    pub fn push(&mut self, row: Vec<String>) {
        let row = row
            .into_iter()
            .enumerate()
            .map(|(i, cell)| match self.limits.get(i).copied().flatten() {
                Some(max) => truncate(&cell, max),
                None => cell,
            })
            .collect();
        self.rows.push(row);
    }

    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let mut out = String::new();
        let headers: Vec<&str> = self.headers.to_vec();
        push_line(&mut out, &headers, &widths);
        let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
        out.push_str(&sep.join("  "));
        out.push('\n');
        for row in &self.rows {
            let cells: Vec<&str> = row.iter().map(String::as_str).collect();
            push_line(&mut out, &cells, &widths);
        }
        out
    }

    pub fn print(&self) {
        print!("{}", self.render());
    }
}

fn push_line(out: &mut String, cells: &[&str], widths: &[usize]) {
    let padded: Vec<String> = cells
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            let w = widths.get(i).copied().unwrap_or(0);
            format!("{cell:w$}")
        })
        .collect();
    out.push_str(padded.join("  ").trim_end());
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("connection refused", 10), "connectio…");
        assert_eq!(truncate("éééé", 3), "éé…");
    }

    #[test]
    fn table_pads_columns_and_caps_limited_ones() {
        let headers = ["STEP", "MESSAGE"];
        let mut table = Table::new(&headers).limit(1, 8);
        table.push(vec!["db".into(), "schema already exists".into()]);
        table.push(vec!["search".into(), "ok".into()]);

        assert_eq!(
            table.render(),
            "STEP    MESSAGE\n------  --------\ndb      schema …\nsearch  ok\n"
        );
    }
}
