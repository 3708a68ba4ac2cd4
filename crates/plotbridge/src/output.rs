use std::fmt::Display;
use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use plotbridge_data::{DType, Element};
use plotbridge_session::{BatchReport, ReceivedBatch, ReceivedBinding};
use serde::Serialize;

/// Values shown per binding before the preview is elided.
const PREVIEW_VALUES: usize = 8;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    /// Script text only.
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
struct BindingOutput<'a> {
    name: &'a str,
    dtype: &'static str,
    code: char,
    count: usize,
    shape: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<&'static str>,
    values: String,
}

#[derive(Serialize)]
struct BatchOutput<'a> {
    event: &'static str,
    session_id: &'a str,
    batch: u64,
    bindings: Vec<BindingOutput<'a>>,
    script: &'a str,
    timestamp: String,
}

#[derive(Serialize)]
struct ReportOutput<'a> {
    event: &'static str,
    batch: u64,
    bindings: usize,
    payload_bytes: usize,
    script_bytes: usize,
    replies: usize,
    returned: Vec<ReturnedOutput<'a>>,
}

#[derive(Serialize)]
struct ReturnedOutput<'a> {
    name: &'a str,
    values: &'a [f64],
}

impl<'a> BindingOutput<'a> {
    fn new(binding: &'a ReceivedBinding) -> Self {
        let header = &binding.header;
        Self {
            name: binding.name(),
            dtype: header.dtype.name(),
            code: header.dtype.code(),
            count: header.element_count,
            shape: header.shape.to_string(),
            reply: header.reply.map(|policy| policy.marker()),
            values: preview(binding),
        }
    }
}

/// Print one batch received by the stand-in companion.
pub fn print_batch(batch: &ReceivedBatch, number: u64, session_id: &str, format: OutputFormat) {
    let bindings: Vec<BindingOutput<'_>> = batch.bindings.iter().map(BindingOutput::new).collect();

    match format {
        OutputFormat::Json => {
            let out = BatchOutput {
                event: "batch",
                session_id,
                batch: number,
                bindings,
                script: &batch.script,
                timestamp: now_unix_seconds(),
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
                .set_header(vec!["NAME", "TYPE", "SHAPE", "REPLY", "VALUES"]);
            for binding in &bindings {
                table.add_row(vec![
                    binding.name.to_string(),
                    binding.dtype.to_string(),
                    binding.shape.clone(),
                    binding.reply.unwrap_or("-").to_string(),
                    binding.values.clone(),
                ]);
            }
            println!("batch {number} ({session_id})");
            println!("{table}");
            print!("{}", batch.script);
        }
        OutputFormat::Pretty => {
            println!("batch={number} session={session_id} bindings={}", bindings.len());
            for binding in &bindings {
                println!(
                    "  {}: {}{} = {}",
                    binding.name, binding.dtype, binding.shape, binding.values
                );
            }
            for line in batch.script.lines() {
                println!("  | {line}");
            }
        }
        OutputFormat::Raw => print_raw(batch.script.as_bytes()),
    }
}

/// Print the outcome of `plotbridge run`.
pub fn print_report(report: &BatchReport, returned: &[(String, Vec<f64>)], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ReportOutput {
                event: "report",
                batch: report.batch,
                bindings: report.bindings,
                payload_bytes: report.payload_bytes,
                script_bytes: report.script_bytes,
                replies: report.replies,
                returned: returned
                    .iter()
                    .map(|(name, values)| ReturnedOutput { name, values })
                    .collect(),
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
                .set_header(vec!["BATCH", "BINDINGS", "PAYLOAD", "SCRIPT", "REPLIES"])
                .add_row(vec![
                    report.batch.to_string(),
                    report.bindings.to_string(),
                    report.payload_bytes.to_string(),
                    report.script_bytes.to_string(),
                    report.replies.to_string(),
                ]);
            println!("{table}");
            for (name, values) in returned {
                println!("{name} = {}", join(values));
            }
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            println!(
                "batch={} bindings={} payload_bytes={} script_bytes={} replies={}",
                report.batch,
                report.bindings,
                report.payload_bytes,
                report.script_bytes,
                report.replies
            );
            for (name, values) in returned {
                println!("  {name} = {}", join(values));
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn preview(binding: &ReceivedBinding) -> String {
    match binding.header.dtype {
        DType::I8 => preview_values::<i8>(binding),
        DType::U8 => preview_values::<u8>(binding),
        DType::I16 => preview_values::<i16>(binding),
        DType::U16 => preview_values::<u16>(binding),
        DType::I32 => preview_values::<i32>(binding),
        DType::U32 => preview_values::<u32>(binding),
        DType::I64 => preview_values::<i64>(binding),
        DType::U64 => preview_values::<u64>(binding),
        DType::F32 => preview_values::<f32>(binding),
        DType::F64 => preview_values::<f64>(binding),
        DType::Char => match binding.text() {
            Ok(text) => format!("{text:?}"),
            Err(err) => format!("<{err}>"),
        },
    }
}

fn preview_values<T: Element + Display>(binding: &ReceivedBinding) -> String {
    match binding.values::<T>() {
        Ok(values) => join(&values),
        Err(err) => format!("<{err}>"),
    }
}

fn join<T: Display>(values: &[T]) -> String {
    let mut out = String::from("[");
    for (index, value) in values.iter().take(PREVIEW_VALUES).enumerate() {
        if index > 0 {
            out.push_str(", ");
        }
        out.push_str(&value.to_string());
    }
    if values.len() > PREVIEW_VALUES {
        out.push_str(&format!(", … {} more", values.len() - PREVIEW_VALUES));
    }
    out.push(']');
    out
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
