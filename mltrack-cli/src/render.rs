//! Plain-text console rendering.

use mltrack_core::Run;
use mltrack_core::analysis::MetricStats;

/// Render rows as left-aligned columns separated by two spaces.
pub fn format_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }

    let mut out = String::new();
    out.push_str(&format_line(headers, &widths));
    out.push('\n');
    for row in rows {
        out.push_str(&format_line(row, &widths));
        out.push('\n');
    }
    out
}

fn format_line(cells: &[String], widths: &[usize]) -> String {
    cells
        .iter()
        .zip(widths)
        .map(|(cell, w)| format!("{cell:<w$}"))
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}

/// Statistics as a table with values rounded to four decimals.
pub fn format_stats(stats: &[MetricStats]) -> String {
    let headers: Vec<String> = ["metric", "count", "mean", "std", "min", "max"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let rows: Vec<Vec<String>> = stats
        .iter()
        .map(|s| {
            vec![
                s.label.clone(),
                s.count.to_string(),
                format!("{:.4}", s.mean),
                s.std.map(|v| format!("{v:.4}")).unwrap_or_else(|| "-".into()),
                format!("{:.4}", s.min),
                format!("{:.4}", s.max),
            ]
        })
        .collect();
    format_table(&headers, &rows)
}

/// Key facts about a run, one `label: value` per line. Absent values are skipped.
pub fn format_run_details(run: &Run) -> String {
    let mut lines = vec![
        format!("Run ID: {}", run.id()),
        format!("Name: {}", run.display_name()),
        format!("Status: {}", run.status),
    ];
    for (key, label) in [
        ("imgsz", "Image size"),
        ("lr0", "Learning rate"),
        ("seed", "Seed"),
    ] {
        if let Some(value) = run.param(key) {
            lines.push(format!("{label}: {value}"));
        }
    }
    for (key, label) in [
        ("mAP50", "mAP@50"),
        ("mAP50-95", "mAP@50-95"),
        ("precision", "Precision"),
        ("recall", "Recall"),
    ] {
        if let Some(value) = run.metric(key).filter(|v| v.is_finite()) {
            lines.push(format!("{label}: {value:.4}"));
        }
    }
    lines.join("\n")
}

/// Tracking UI page of a registered model.
pub fn model_ui_url(tracking_uri: &str, model_name: &str) -> String {
    format!("{}/#/models/{}", tracking_uri.trim_end_matches('/'), model_name)
}

/// Size in megabytes with two decimals.
pub fn format_megabytes(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / 1024.0 / 1024.0)
}

pub fn rule() -> String {
    "=".repeat(60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_format_table_aligns_columns() {
        let headers = strings(&["run_id", "mAP@50"]);
        let rows = vec![strings(&["abc", "0.6"]), strings(&["abcdefgh", ""])];
        assert_eq!(
            format_table(&headers, &rows),
            "run_id    mAP@50\nabc       0.6\nabcdefgh\n"
        );
    }

    #[test]
    fn test_format_stats_rounds_and_marks_missing_std() {
        let stats = vec![
            MetricStats::compute("mAP@50", &[0.6, 0.8]).unwrap(),
            MetricStats::compute("recall", &[0.5]).unwrap(),
        ];
        let text = format_stats(&stats);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "metric  count  mean    std     min     max");
        assert_eq!(lines[1], "mAP@50  2      0.7000  0.1414  0.6000  0.8000");
        assert_eq!(lines[2], "recall  1      0.5000  -       0.5000  0.5000");
    }

    #[test]
    fn test_run_details_skip_absent_values() {
        let run = Run::new("abc123")
            .with_name("exp_320")
            .with_param("imgsz", "320")
            .with_metric("mAP50", 0.87346);
        assert_eq!(
            format_run_details(&run),
            "Run ID: abc123\nName: exp_320\nStatus: FINISHED\nImage size: 320\nmAP@50: 0.8735"
        );
    }

    #[test]
    fn test_model_ui_url() {
        assert_eq!(
            model_ui_url("http://localhost:5000/", "yolo_person_detector"),
            "http://localhost:5000/#/models/yolo_person_detector"
        );
    }

    #[test]
    fn test_format_megabytes() {
        assert_eq!(format_megabytes(5 * 1024 * 1024 + 512 * 1024), "5.50 MB");
    }
}
