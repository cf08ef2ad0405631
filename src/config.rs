use once_cell::sync::Lazy;

pub const FRAMES_MAX: usize = 1024;
pub const STACK_MAX: usize = FRAMES_MAX * 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigKey {
    InstructionBudget,
    MaxHeap,
    MaxFrames,
    MaxStack,
    GcLog,
    DebugTrace,
    StackTrace,
}

static ENV_KEYS: phf::Map<&'static str, ConfigKey> = phf::phf_map! {
    "MOCHA_INSTR_BUDGET" => ConfigKey::InstructionBudget,
    "MOCHA_MAX_HEAP" => ConfigKey::MaxHeap,
    "MOCHA_MAX_FRAMES" => ConfigKey::MaxFrames,
    "MOCHA_MAX_STACK" => ConfigKey::MaxStack,
    "MOCHA_GC_LOG" => ConfigKey::GcLog,
    "MOCHA_DEBUG_TRACE" => ConfigKey::DebugTrace,
    "MOCHA_STACK_TRACE" => ConfigKey::StackTrace,
};

static FALSY_WORDS: phf::Set<&'static str> = phf::phf_set! {
    "0",
    "no",
    "off",
    "false",
};

static ENV_CONFIG: Lazy<VmConfig> = Lazy::new(|| VmConfig::from_lookup(|key| std::env::var(key).ok()));

/// Runtime limits and diagnostics toggles. The engine never parses a command
/// line; embedders build this directly or read it from the environment.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VmConfig {
    pub instruction_budget: Option<u64>,
    pub max_stack_slots: usize,
    pub max_frames: usize,
    pub max_heap_bytes: Option<usize>,
    pub gc_log: bool,
    pub debug_trace: bool,
    pub debug_bytecode: bool,
    pub stack_trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            instruction_budget: None,
            max_stack_slots: STACK_MAX,
            max_frames: FRAMES_MAX,
            max_heap_bytes: None,
            gc_log: false,
            debug_trace: false,
            debug_bytecode: false,
            stack_trace: true,
        }
    }
}

impl VmConfig {
    /// Configuration from `MOCHA_*` environment variables, read once per process.
    pub fn from_env() -> VmConfig {
        ENV_CONFIG.clone()
    }

    /// Build a configuration from an arbitrary variable source. Unparseable
    /// values leave the default in place.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> VmConfig {
        let mut config = VmConfig::default();
        for (name, key) in ENV_KEYS.entries() {
            let Some(raw) = lookup(name) else {
                continue;
            };
            let raw = raw.trim();
            match key {
                ConfigKey::InstructionBudget => {
                    if let Some(budget) = parse_u64(raw) {
                        config.instruction_budget = Some(budget);
                    }
                }
                ConfigKey::MaxHeap => {
                    if let Some(bytes) = parse_size(raw) {
                        config.max_heap_bytes = Some(bytes);
                    }
                }
                ConfigKey::MaxFrames => {
                    if let Some(frames) = parse_positive(raw) {
                        config.max_frames = frames.min(FRAMES_MAX);
                    }
                }
                ConfigKey::MaxStack => {
                    if let Some(slots) = parse_positive(raw) {
                        config.max_stack_slots = slots.min(STACK_MAX);
                    }
                }
                ConfigKey::GcLog => config.gc_log = flag_enabled(raw),
                ConfigKey::DebugTrace => {
                    config.debug_trace = flag_enabled(raw);
                    config.debug_bytecode = config.debug_trace;
                }
                ConfigKey::StackTrace => config.stack_trace = raw.is_empty() || flag_enabled(raw),
            }
        }
        config
    }
}

pub fn flag_enabled(value: &str) -> bool {
    !value.is_empty() && !FALSY_WORDS.contains(value.to_ascii_lowercase().as_str())
}

fn parse_u64(value: &str) -> Option<u64> {
    value.parse().ok()
}

fn parse_positive(value: &str) -> Option<usize> {
    value.parse::<usize>().ok().filter(|n| *n > 0)
}

/// Decimal byte count with an optional `k`, `m` or `g` suffix. Saturates on overflow.
fn parse_size(value: &str) -> Option<usize> {
    let (digits, multiplier) = match value.char_indices().last() {
        Some((index, suffix)) if suffix.is_ascii_alphabetic() => {
            let multiplier: usize = match suffix.to_ascii_lowercase() {
                'k' => 1024,
                'm' => 1024 * 1024,
                'g' => 1024 * 1024 * 1024,
                _ => return None,
            };
            (&value[..index], multiplier)
        }
        _ => (value, 1),
    };
    let count: usize = digits.trim_end().parse().ok()?;
    Some(count.saturating_mul(multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> VmConfig {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        VmConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(config_from(&[]), VmConfig::default());
        assert!(VmConfig::default().stack_trace);
    }

    #[test]
    fn limits_are_parsed_and_clamped() {
        let config = config_from(&[
            ("MOCHA_INSTR_BUDGET", "5000"),
            ("MOCHA_MAX_HEAP", "8m"),
            ("MOCHA_MAX_FRAMES", "999999"),
            ("MOCHA_MAX_STACK", "64"),
        ]);
        assert_eq!(config.instruction_budget, Some(5000));
        assert_eq!(config.max_heap_bytes, Some(8 * 1024 * 1024));
        assert_eq!(config.max_frames, FRAMES_MAX);
        assert_eq!(config.max_stack_slots, 64);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let config = config_from(&[("MOCHA_MAX_HEAP", "12x"), ("MOCHA_MAX_FRAMES", "0")]);
        assert_eq!(config.max_heap_bytes, None);
        assert_eq!(config.max_frames, FRAMES_MAX);
    }

    #[test]
    fn flag_words() {
        assert!(flag_enabled("1"));
        assert!(flag_enabled("yes"));
        assert!(!flag_enabled("OFF"));
        assert!(!flag_enabled("False"));
        assert!(!flag_enabled(""));
        let config = config_from(&[("MOCHA_STACK_TRACE", "no"), ("MOCHA_GC_LOG", "on")]);
        assert!(!config.stack_trace);
        assert!(config.gc_log);
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("2k"), Some(2048));
        assert_eq!(parse_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("k"), None);
    }
}
