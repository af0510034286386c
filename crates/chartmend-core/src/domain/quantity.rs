//! Kubernetes resource quantity helpers.
//!
//! CPU is normalized to millicores and memory to MiB, which is the
//! granularity every rule threshold is expressed in.

const CPU_UNIT_THRESHOLD: f64 = 1000.0;
const MEMORY_GI_THRESHOLD: f64 = 1024.0;

/// Parse a CPU quantity (`"250m"`, `"0.5"`, `"2"`) into millicores.
pub fn parse_cpu_millicores(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(millis) = raw.strip_suffix('m') {
        return millis.trim().parse::<f64>().ok().filter(|v| v.is_finite());
    }
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|cores| cores * 1000.0)
}

/// Parse a memory quantity (`"128Mi"`, `"1Gi"`, `"512M"`, `"1048576"`) into MiB.
///
/// A bare number is read as MiB, matching how chart authors usually write
/// values-file shorthand. Binary suffixes are matched case-insensitively.
/// A lowercase `m` is the millibyte suffix and is rejected rather than read
/// as megabytes.
pub fn parse_memory_mib(raw: &str) -> Option<f64> {
    const BINARY: [(&str, f64); 4] = [
        ("ki", 1.0 / 1024.0),
        ("mi", 1.0),
        ("gi", 1024.0),
        ("ti", 1024.0 * 1024.0),
    ];
    const MIB: f64 = 1024.0 * 1024.0;

    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let number = |text: &str| text.trim().parse::<f64>().ok().filter(|v| v.is_finite());

    let lowered = raw.to_ascii_lowercase();
    for (suffix, factor) in BINARY {
        if let Some(n) = lowered.strip_suffix(suffix) {
            return number(n).map(|v| v * factor);
        }
    }
    let factor = match raw.chars().last()? {
        'k' | 'K' => 1e3 / MIB,
        'M' => 1e6 / MIB,
        'G' | 'g' => 1e9 / MIB,
        'T' | 't' => 1e12 / MIB,
        'm' => return None,
        _ => return number(raw),
    };
    number(&raw[..raw.len() - 1]).map(|v| v * factor)
}

/// Format millicores as a quantity, switching to whole cores at 1000m.
pub fn format_cpu(millicores: f64) -> String {
    let value = millicores.max(1.0);
    if value >= CPU_UNIT_THRESHOLD && (value % CPU_UNIT_THRESHOLD) == 0.0 {
        format!("{}", (value / CPU_UNIT_THRESHOLD) as u64)
    } else {
        format!("{}m", value as u64)
    }
}

/// Format MiB as a quantity, switching to Gi when the value divides evenly.
pub fn format_memory(mib: f64) -> String {
    let value = mib.max(1.0);
    if value >= MEMORY_GI_THRESHOLD && (value % MEMORY_GI_THRESHOLD) == 0.0 {
        format!("{}Gi", (value / MEMORY_GI_THRESHOLD) as u64)
    } else {
        format!("{}Mi", value as u64)
    }
}

/// Double a CPU quantity, defaulting to `500m` when it cannot be parsed.
pub fn double_cpu(raw: &str) -> String {
    match parse_cpu_millicores(raw) {
        Some(v) if v > 0.0 => format_cpu(v * 2.0),
        _ => "500m".to_string(),
    }
}

/// Double a memory quantity, defaulting to `256Mi` when it cannot be parsed.
pub fn double_memory(raw: &str) -> String {
    match parse_memory_mib(raw) {
        Some(v) if v > 0.0 => format_memory(v * 2.0),
        _ => "256Mi".to_string(),
    }
}

/// Render a YAML scalar (string or number) as a quantity string.
pub fn scalar_to_quantity(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
