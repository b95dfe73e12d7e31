use ctxgate_protocol::envelope::ToolEntry;

/// Local relevance scoring: normalized token-set overlap between each tool's
/// description and the user query, penalized by description length so terse,
/// on-topic tools outrank sprawling ones. Ties break by original index.
pub fn score_tools(
    catalog: &[ToolEntry],
    query: &str,
    max_tools: usize,
    min_tools: usize,
    target_ratio: f64,
) -> Vec<String> {
    if catalog.is_empty() {
        return Vec::new();
    }
    let query_tokens = token_set(query);
    let mut scored: Vec<(usize, f64)> = catalog
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let haystack = format!("{} {}", entry.name.replace('_', " "), entry.description);
            let tool_tokens = token_set(&haystack);
            let overlap = tool_tokens
                .iter()
                .filter(|token| query_tokens.contains(*token))
                .count();
            let score = if tool_tokens.is_empty() {
                0.0
            } else {
                overlap as f64 / (tool_tokens.len() as f64).sqrt()
            };
            (index, score)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });

    // The floor takes precedence when it collides with the ratio ceiling on
    // a small catalog; max_tools stays a hard upper bound either way.
    let ratio_bound = ((catalog.len() as f64) * target_ratio).ceil() as usize;
    let keep = min_tools
        .max(ratio_bound)
        .min(max_tools)
        .min(catalog.len());

    let mut kept: Vec<usize> = scored.into_iter().take(keep).map(|(index, _)| index).collect();
    kept.sort_unstable();
    kept.into_iter()
        .map(|index| catalog[index].name.clone())
        .collect()
}

fn token_set(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() > 2)
        .map(|token| token.to_ascii_lowercase())
        .collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, description: &str) -> ToolEntry {
        ToolEntry {
            name: name.to_string(),
            description: description.to_string(),
        }
    }

    #[test]
    fn query_terms_rank_matching_tool_first() {
        let catalog = vec![
            entry("run_tests", "Run the project test suite"),
            entry("read_file", "Read a file from disk and return its contents"),
            entry("open_browser", "Open a URL in the default browser"),
        ];
        let kept = score_tools(&catalog, "read the main.go file", 1, 1, 1.0);
        assert_eq!(kept, vec!["read_file".to_string()]);
    }

    #[test]
    fn min_tools_floor_overrides_ratio_ceiling() {
        // Six tools at target_ratio 0.3 bound the ratio ceiling to 2, below
        // the floor of 3; the floor wins.
        let catalog: Vec<ToolEntry> = (0..6)
            .map(|index| entry(&format!("tool_{index}"), "does a thing"))
            .collect();
        let kept = score_tools(&catalog, "unrelated query entirely", 10, 3, 0.3);
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn max_tools_is_a_hard_cap() {
        let catalog: Vec<ToolEntry> = (0..6)
            .map(|index| entry(&format!("tool_{index}"), "does a thing"))
            .collect();
        let kept = score_tools(&catalog, "thing", 1, 2, 1.0);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn order_is_original_index_order() {
        let catalog = vec![
            entry("read_file", "Read a file"),
            entry("grep_file", "Search in a file"),
            entry("write_file", "Write a file"),
        ];
        let kept = score_tools(&catalog, "file", 3, 1, 1.0);
        assert_eq!(kept, vec!["read_file", "grep_file", "write_file"]);
    }

    #[test]
    fn ratio_caps_kept_count() {
        let catalog: Vec<ToolEntry> = (0..10)
            .map(|index| entry(&format!("tool_{index}"), "does a thing"))
            .collect();
        let kept = score_tools(&catalog, "thing", 10, 1, 0.3);
        assert_eq!(kept.len(), 3);
    }
}
