//! Compact one-line rendering of an event for the ingest log.

use std::fmt;

use serde_json::{Map, Value};

use crate::coerce;
use crate::event::IngestEvent;

const OS_MAX_CHARS: usize = 48;
const STATE_MAX_CHARS: usize = 12;

/// Display adapter produced by [`IngestEvent::summary`].
pub struct Summary<'a>(&'a IngestEvent);

impl IngestEvent {
    /// A human-friendly one-liner, e.g.
    /// `iot acme/plant1/line3 status R ts=2023-11-14T22:13:20Z sn=SN1 state=OFF`.
    pub fn summary(&self) -> Summary<'_> {
        Summary(self)
    }
}

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let event = self.0;
        let retain = if event.retained == Some(true) { " R" } else { "" };
        let ts = event
            .reported_time()
            .map(|t| t.at.strftime("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_else(|| "?".to_string());
        let serial = event.serial_number.as_deref().unwrap_or("?");

        write!(
            f,
            "{} {}/{}/{} {}{} ts={} sn={}",
            event.prefix,
            event.customer,
            event.location,
            event.machine,
            event.subtype,
            retain,
            ts,
            serial
        )?;

        let Some(payload) = event.payload.as_ref() else {
            return f.write_str(" payload=<unparsed>");
        };

        match event.subtype.as_str() {
            "status" => write_status(f, payload),
            "statistics" => write_statistics(f, payload),
            "storage" => write_storage(f, payload),
            _ => {
                let keys: Vec<&str> = payload.keys().map(String::as_str).collect();
                write!(f, " keys=[{}]", keys.join(","))
            }
        }
    }
}

fn write_status(f: &mut fmt::Formatter<'_>, payload: &Map<String, Value>) -> fmt::Result {
    let state = payload.get("device_status").and_then(coerce::text);
    write!(f, " state={}", short_state(state.as_deref()))?;

    if let Some(os) = payload
        .get("device_os_version")
        .and_then(coerce::text)
        .filter(|s| !s.is_empty())
    {
        write!(f, " os=\"{}\"", short_os(&os))?;
    }
    Ok(())
}

fn write_statistics(f: &mut fmt::Formatter<'_>, payload: &Map<String, Value>) -> fmt::Result {
    let Some(stats) = payload.get("statistics").and_then(Value::as_object) else {
        return f.write_str(" statistics=<invalid>");
    };

    let counter = |name: &str| {
        stats
            .get(name)
            .and_then(coerce::integer)
            .map(|v| v.to_string())
            .unwrap_or_else(|| "?".to_string())
    };

    write!(
        f,
        " total={} good={} nrd={} oos={} ok={} sent={}",
        counter("total_items"),
        counter("good_reads"),
        counter("no_reads"),
        counter("out_of_spec"),
        counter("success"),
        counter("sent"),
    )
}

fn write_storage(f: &mut fmt::Formatter<'_>, payload: &Map<String, Value>) -> fmt::Result {
    let Some(storage) = payload.get("storage").and_then(Value::as_object) else {
        return f.write_str(" storage=<invalid>");
    };

    let mut parts = Vec::with_capacity(storage.len());
    for (drive, info) in storage {
        let Some(info) = info.as_object() else {
            continue;
        };
        let measure = |name: &str, unit: &str| {
            info.get(name)
                .and_then(coerce::float)
                .map(|v| format!("{}{unit}", short_float(v)))
                .unwrap_or_else(|| "?".to_string())
        };
        parts.push(format!(
            "{drive}: {} ({}/{})",
            measure("used_pct", "%"),
            measure("used_gb", "GB"),
            measure("total_gb", "GB"),
        ));
    }

    if parts.is_empty() {
        f.write_str(" <empty>")
    } else {
        write!(f, " {}", parts.join(", "))
    }
}

/// Two decimals with trailing zeros trimmed: `42.50` renders as `42.5`, `100.00` as `100`.
fn short_float(value: f64) -> String {
    let fixed = format!("{value:.2}");
    if fixed.contains('.') {
        fixed.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        fixed
    }
}

fn squash_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn shorten(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let mut out: String = value.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

fn short_os(value: &str) -> String {
    let text = squash_whitespace(value);
    let stripped = match text.get(..10) {
        Some(head) if head.eq_ignore_ascii_case("microsoft ") => &text[10..],
        _ => text.as_str(),
    };
    shorten(stripped, OS_MAX_CHARS)
}

fn short_state(value: Option<&str>) -> String {
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return "?".to_string();
    };
    let normalized = squash_whitespace(value).to_lowercase();
    match normalized.as_str() {
        "online" => "ON".to_string(),
        "offline" => "OFF".to_string(),
        other => shorten(other, STATE_MAX_CHARS),
    }
}

#[cfg(test)]
mod tests {
    use crate::decode;

    fn line(topic: &str, body: &str, retained: bool) -> String {
        decode(topic, body.as_bytes(), Some(0), Some(retained))
            .unwrap()
            .summary()
            .to_string()
    }

    #[test]
    fn status_line() {
        let out = line(
            "iot/acme/plant1/line3/status",
            r#"{"serial_number":"SN1","ts":1700000000000,"device_status":"Offline","device_os_version":"Microsoft   Windows 11 Pro"}"#,
            true,
        );
        assert_eq!(
            out,
            "iot acme/plant1/line3 status R ts=2023-11-14T22:13:20Z sn=SN1 state=OFF os=\"Windows 11 Pro\""
        );
    }

    #[test]
    fn storage_line() {
        let out = line(
            "iot/acme/plant1/line3/storage",
            r#"{"storage":{"C:":{"used_pct":42.5,"used_gb":100,"total_gb":235.456},"D":"bogus"}}"#,
            false,
        );
        assert_eq!(
            out,
            "iot acme/plant1/line3 storage ts=? sn=? C:: 42.5% (100GB/235.46GB)"
        );
    }

    #[test]
    fn statistics_line_marks_missing_counters() {
        let out = line(
            "iot/acme/plant1/line3/statistics",
            r#"{"serial_number":7,"statistics":{"total_items":10,"good_reads":"9"}}"#,
            false,
        );
        assert_eq!(
            out,
            "iot acme/plant1/line3 statistics ts=? sn=7 total=10 good=9 nrd=? oos=? ok=? sent=?"
        );
    }

    #[test]
    fn invalid_sections_and_unknown_subtypes() {
        assert!(
            line("iot/a/b/c/storage", r#"{"storage":[]}"#, false).ends_with(" storage=<invalid>")
        );
        assert!(line("iot/a/b/c/status", "garbage", false).ends_with(" payload=<unparsed>"));
        assert!(
            line("iot/a/b/c/heartbeat", r#"{"b":1,"a":2}"#, false).ends_with(" keys=[a,b]")
        );
    }

    #[test]
    fn long_values_are_shortened() {
        assert_eq!(super::shorten("abcdef", 4), "abc…");
        assert_eq!(super::short_state(Some("  Sleeping  Deeply Now ")), "sleeping de…");
        assert_eq!(super::short_float(100.0), "100");
        assert_eq!(super::short_float(0.004), "0");
    }
}
