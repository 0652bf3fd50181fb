use std::collections::HashMap;
use tracing::debug;

/// Look up a client-facing token (model name or API version) in a mapping
/// table, falling back to `default` on a miss.
pub fn resolve<'a>(table: &'a HashMap<String, String>, key: &str, default: &'a str) -> &'a str {
    match table.get(key) {
        Some(value) => value,
        None => {
            debug!(key = %key, fallback = %default, "No mapping entry, using default");
            default
        }
    }
}

/// Parse the `key=value,key2=value2` form used by environment variables.
///
/// Entries that do not contain exactly one `=` are ignored.
pub fn parse_mappings(input: &str) -> HashMap<String, String> {
    input
        .split(',')
        .filter_map(|pair| {
            let mut parts = pair.split('=');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) => {
                    let (key, value) = (key.trim(), value.trim());
                    (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> HashMap<String, String> {
        parse_mappings("claude-3-5-sonnet=anthropic.claude-3-5-sonnet-20241022-v2:0")
    }

    #[test]
    fn test_resolve_hit() {
        let table = table();
        assert_eq!(
            resolve(&table, "claude-3-5-sonnet", "default-model"),
            "anthropic.claude-3-5-sonnet-20241022-v2:0"
        );
    }

    #[test]
    fn test_resolve_miss_uses_default() {
        let table = table();
        assert_eq!(resolve(&table, "unknown", "default-model"), "default-model");
        assert_eq!(resolve(&table, "", "default-model"), "default-model");
    }

    #[test]
    fn test_parse_mappings_trims_whitespace() {
        let mappings = parse_mappings(" a = b ,c=d");
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings["a"], "b");
        assert_eq!(mappings["c"], "d");
    }

    #[test]
    fn test_parse_mappings_skips_malformed_entries() {
        let mappings = parse_mappings("novalue,a=b=c,=orphan,ok=yes,");
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings["ok"], "yes");
    }

    #[test]
    fn test_parse_mappings_empty() {
        assert!(parse_mappings("").is_empty());
    }
}
