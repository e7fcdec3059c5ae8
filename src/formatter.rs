use crate::models::{AggregateResult, LimitDetail, UsageInfo};
use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use std::fmt::Write;

/// Shown in the status line before the first cycle completes.
pub const PENDING_MARKER: &str = "⏳";

const ERROR_MARKER: &str = "ERR";

/// `13` rather than `13.0`, but keep real fractions.
fn amount(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}

fn local_time(dt: DateTime<Utc>) -> String {
    dt.with_timezone(&Local).format("%Y-%m-%d %H:%M %Z").to_string()
}

fn quota(used: f64, limit: Option<f64>, percent: Option<f64>) -> String {
    match (limit, percent) {
        (Some(limit), Some(percent)) => format!(
            "{}/{} ({}%)",
            amount(used),
            amount(limit),
            percent.round() as i64
        ),
        _ => format!("{} (unlimited)", amount(used)),
    }
}

fn write_limit(out: &mut String, indent: &str, limit: &LimitDetail) {
    let _ = write!(
        out,
        "{}{}: {}",
        indent,
        limit.window,
        quota(limit.used, limit.limit, limit.percent())
    );
    if let Some(remaining) = limit.remaining {
        let _ = write!(out, "  remaining {}", amount(remaining));
    }
    if let Some(reset) = limit.reset_time {
        let _ = write!(out, "  resets {}", local_time(reset));
    }
    out.push('\n');

    for detail in &limit.usage_details {
        let _ = writeln!(out, "{}  • {}: {}", indent, detail.model_code, amount(detail.usage));
    }
}

fn write_usage(out: &mut String, width: usize, usage: &UsageInfo) {
    let indent = " ".repeat(width + 2);

    let _ = write!(
        out,
        "{:<width$}  {}",
        usage.provider(),
        quota(usage.used(), usage.limit(), usage.percent()),
        width = width
    );
    if let Some(remaining) = usage.remaining() {
        let _ = write!(out, "  remaining {}", amount(remaining));
    }
    if let Some(reset) = usage.reset_time() {
        let _ = write!(out, "  resets {}", local_time(reset));
    }
    out.push('\n');

    if let Some(level) = usage.membership_level() {
        let _ = writeln!(out, "{}membership: {}", indent, level);
    }
    if let Some(user_id) = usage.user_id() {
        let _ = writeln!(out, "{}user: {}", indent, user_id);
    }
    for (key, value) in usage.extra() {
        let _ = writeln!(out, "{}{}: {}", indent, key, value);
    }
    for limit in usage.limits() {
        write_limit(out, &indent, limit);
    }
}

/// Human-readable report with one block per configured provider.
pub fn render_table(result: &AggregateResult) -> String {
    let width = result
        .providers
        .iter()
        .map(|r| r.provider.chars().count())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for report in &result.providers {
        match &report.outcome {
            Ok(usage) => write_usage(&mut out, width, usage),
            Err(err) => {
                let _ = writeln!(
                    out,
                    "{:<width$}  ERROR — {}: {}",
                    report.provider,
                    err.kind(),
                    err,
                    width = width
                );
            }
        }
    }

    if result.is_empty() {
        out.push_str("No providers configured.\n");
    }
    out
}

pub fn render_json(result: &AggregateResult) -> Result<String> {
    Ok(serde_json::to_string_pretty(result)?)
}

/// Single status-bar line: `kimi: 13% | bigmodel: 45%`, `name: ERR` on failure.
pub fn menubar_summary(result: &AggregateResult) -> String {
    result
        .providers
        .iter()
        .map(|report| match &report.outcome {
            Ok(usage) => match usage.rounded_percent() {
                Some(percent) => format!("{}: {}%", report.provider, percent),
                None => format!("{}: {}", report.provider, amount(usage.used())),
            },
            Err(_) => format!("{}: {}", report.provider, ERROR_MARKER),
        })
        .collect::<Vec<_>>()
        .join(" | ")
}
