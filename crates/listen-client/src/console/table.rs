//! Plain-text tables for console output.  Column widths are measured in
//! terminal cells so CJK titles line up.

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

const MAX_CELL: usize = 48;

pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn render(&self) -> String {
        let columns = self.headers.len();
        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| {
                (0..columns)
                    .map(|i| truncate(row.get(i).map(String::as_str).unwrap_or(""), MAX_CELL))
                    .collect()
            })
            .collect();

        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.width()).collect();
        for row in &cells {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.width());
            }
        }

        let mut out = String::new();
        push_line(&mut out, &self.headers, &widths);
        let rule: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
        push_line(&mut out, &rule, &widths);
        for row in &cells {
            push_line(&mut out, row, &widths);
        }
        out
    }
}

fn push_line(out: &mut String, cells: &[String], widths: &[usize]) {
    let mut line = String::new();
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            line.push_str("  ");
        }
        line.push_str(cell);
        if i + 1 < cells.len() {
            line.push_str(&" ".repeat(widths[i].saturating_sub(cell.width())));
        }
    }
    out.push_str(line.trim_end());
    out.push('\n');
}

/// Cut `text` to at most `max` cells, marking the cut with `…`.
pub fn truncate(text: &str, max: usize) -> String {
    if text.width() <= max {
        return text.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for c in text.chars() {
        let w = c.width().unwrap_or(0);
        if used + w + 1 > max {
            break;
        }
        out.push(c);
        used += w;
    }
    out.push('…');
    out
}

/// `Key: value` lines with the keys padded to a common width.
pub fn fields(rows: &[(&str, String)]) -> String {
    let width = rows.iter().map(|(k, _)| k.width()).max().unwrap_or(0);
    let mut out = String::new();
    for (key, value) in rows {
        if value.is_empty() {
            continue;
        }
        out.push_str(&format!(
            "{}{}  {}\n",
            key,
            " ".repeat(width - key.width()),
            value
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_characters_are_aligned() {
        let mut table = Table::new(&["ID", "Title"]);
        table.push(vec!["1".into(), "ハレ晴レユカイ".into()]);
        table.push(vec!["22".into(), "God knows".into()]);
        let rendered = table.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "ID  Title");
        assert_eq!(lines[2], "1   ハレ晴レユカイ");
        assert_eq!(lines[3], "22  God knows");
    }

    #[test]
    fn long_cells_are_cut_by_width() {
        let cut = truncate("涼宮ハルヒの憂鬱", 7);
        assert_eq!(cut, "涼宮ハ…");
        assert!(cut.width() <= 7);
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn empty_fields_are_skipped() {
        let out = fields(&[("Title", "Koi".into()), ("Album", String::new()), ("ID", "1".into())]);
        assert_eq!(out, "Title  Koi\nID     1\n");
    }
}
