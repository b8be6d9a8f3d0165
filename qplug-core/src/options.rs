//! Parsing of install argument strings (`key=value` or bare `key`) into a
//! typed [`Options`]. Unrecognized keys are ignored; malformed numeric values
//! become zero. Nothing here ever fails.

/// Parsed `install` arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Hard ceiling on `insn_count`. Zero disables the limit.
    pub limit: u64,
    /// ELF file to parse for `main`.
    pub binary: Option<String>,
    /// Virtual instructions charged per syscall. Zero disables.
    pub syscall_cost: u64,
    /// Count from the first translated instruction instead of from `main`.
    pub from_start: bool,
}

impl Options {
    pub fn parse<'a, I: IntoIterator<Item = &'a str>>(args: I) -> Self {
        let mut options = Options::default();
        for arg in args {
            let (key, value) = match arg.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (arg, None),
            };
            match key {
                "limit" => options.limit = parse_u64(value),
                "binary" => options.binary = value.map(str::to_string),
                "syscall_cost" => options.syscall_cost = parse_u64(value),
                "from_start" => options.from_start = parse_bool(value),
                _ => {}
            }
        }
        options
    }
}

fn parse_u64(value: Option<&str>) -> u64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn parse_bool(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => matches!(v, "true" | "on" | "1"),
    }
}
