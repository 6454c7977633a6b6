use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct CallOutput<'a> {
    service: &'a str,
    method: &'a str,
    channel: &'a str,
    elapsed_ms: f64,
    result: &'a Value,
}

pub struct CallReport<'a> {
    pub service: &'a str,
    pub method: &'a str,
    pub channel: &'a str,
    pub elapsed_ms: f64,
    pub result: &'a Value,
}

pub fn print_call(report: &CallReport<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = CallOutput {
                service: report.service,
                method: report.method,
                channel: report.channel,
                elapsed_ms: report.elapsed_ms,
                result: report.result,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METHOD", "CHANNEL", "ELAPSED", "RESULT"])
                .add_row(vec![
                    format!("{}#{}", report.service, report.method),
                    report.channel.to_string(),
                    format!("{:.2}ms", report.elapsed_ms),
                    value_preview(report.result),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{}#{} via {} ({:.2}ms):",
                report.service, report.method, report.channel, report.elapsed_ms
            );
            println!(
                "{}",
                serde_json::to_string_pretty(report.result)
                    .unwrap_or_else(|_| value_preview(report.result))
            );
        }
        OutputFormat::Raw => {
            print_raw(value_preview(report.result).as_bytes());
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// Strings print bare, everything else as compact JSON.
pub fn value_preview(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub fn round_ms(elapsed: std::time::Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn previews_strings_bare() {
        assert_eq!(value_preview(&json!("Windows")), "Windows");
        assert_eq!(value_preview(&json!({"a": 1})), "{\"a\":1}");
        assert_eq!(value_preview(&Value::Null), "null");
    }

    #[test]
    fn rounds_to_hundredths() {
        assert_eq!(round_ms(std::time::Duration::from_micros(1234)), 1.23);
    }
}
