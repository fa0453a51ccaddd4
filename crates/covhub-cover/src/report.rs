//! Plain-text rendering of coverage diffs

use crate::diff::DeltaCov;

const HEADERS: [&str; 4] = ["File", "Base Coverage", "New Coverage", "Delta"];

/// Render diff rows as a bordered table
///
/// ```text
/// +-----------------------+---------------+--------------+-------+
/// |         File          | Base Coverage | New Coverage | Delta |
/// +-----------------------+---------------+--------------+-------+
/// | qiniu.com/app/main.go |     50.0%     |    100.0%    | 50.0% |
/// | Total                 |     50.0%     |    100.0%    | 50.0% |
/// +-----------------------+---------------+--------------+-------+
/// ```
pub fn render_table(rows: &[DeltaCov]) -> String {
    let cells: Vec<[&str; 4]> = rows
        .iter()
        .map(|r| {
            [
                r.file_name.as_str(),
                r.base_percentage.as_str(),
                r.new_percentage.as_str(),
                r.delta_percentage.as_str(),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(|h| h.chars().count());
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let border = {
        let mut line = String::from("+");
        for width in &widths {
            line.push_str(&"-".repeat(width + 2));
            line.push('+');
        }
        line
    };

    let mut out = String::new();
    out.push_str(&border);
    out.push('\n');
    out.push_str(&render_row(&HEADERS, &widths, true));
    out.push_str(&border);
    out.push('\n');
    for row in &cells {
        out.push_str(&render_row(row, &widths, false));
    }
    out.push_str(&border);
    out.push('\n');
    out
}

fn render_row(cells: &[&str; 4], widths: &[usize; 4], header: bool) -> String {
    let mut line = String::from("|");
    for (idx, (cell, width)) in cells.iter().zip(widths).enumerate() {
        // File names are left aligned, everything else centered.
        if idx == 0 && !header {
            line.push_str(&format!(" {:<width$} |", cell, width = *width));
        } else {
            line.push_str(&format!(" {:^width$} |", cell, width = *width));
        }
    }
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(file: &str, base: &str, new: &str, delta: &str) -> DeltaCov {
        DeltaCov {
            file_name: file.to_string(),
            base_percentage: base.to_string(),
            new_percentage: new.to_string(),
            delta_percentage: delta.to_string(),
        }
    }

    #[test]
    fn test_render_table() {
        let rows = vec![
            row("qiniu.com/app/main.go", "50.0%", "100.0%", "50.0%"),
            row("Total", "50.0%", "100.0%", "50.0%"),
        ];

        let expected = "\
+-----------------------+---------------+--------------+-------+
|         File          | Base Coverage | New Coverage | Delta |
+-----------------------+---------------+--------------+-------+
| qiniu.com/app/main.go |     50.0%     |    100.0%    | 50.0% |
| Total                 |     50.0%     |    100.0%    | 50.0% |
+-----------------------+---------------+--------------+-------+
";
        assert_eq!(render_table(&rows), expected);
    }

    #[test]
    fn test_render_empty_table() {
        let table = render_table(&[]);
        assert_eq!(table.lines().count(), 4);
        assert!(table.contains("Base Coverage"));
    }
}
