//! Context block assembly for prompt injection.
//!
//! Turns ranked retrieval results into a single text block, grouped by
//! source document and labeled with provenance, bounded by a character
//! budget. Truncation drops whole chunks from the lowest-ranked end; a
//! chunk is never cut mid-text. Empty input yields an empty block so no
//! placeholder ever leaks into the prompt.

use crate::models::RetrievalResult;

/// Assemble retrieval results into a bounded context block.
///
/// `max_chars` bounds the total character count of the returned string.
pub fn assemble_context(results: &[RetrievalResult], max_chars: usize) -> String {
    if results.is_empty() {
        return String::new();
    }

    // Select chunks by rank until the budget is spent, counting the
    // provenance header the first time each document contributes.
    let mut selected: Vec<&RetrievalResult> = Vec::new();
    let mut seen_docs: Vec<&str> = Vec::new();
    let mut used = 0usize;

    for result in results {
        let mut cost = result.text.chars().count() + 1; // trailing newline
        let is_new_doc = !seen_docs.contains(&result.document_id.as_str());
        if is_new_doc {
            cost += header(&result.file_name, &result.document_id).chars().count() + 1;
            // Every group after the first is preceded by a blank line.
            if !seen_docs.is_empty() {
                cost += 1;
            }
        }

        if used + cost > max_chars {
            break;
        }

        used += cost;
        if is_new_doc {
            seen_docs.push(result.document_id.as_str());
        }
        selected.push(result);
    }

    if selected.is_empty() {
        return String::new();
    }

    // Group the selected chunks by document, documents ordered by their
    // best-ranked chunk, chunks within a group in rank order.
    let mut block = String::new();
    for doc_id in &seen_docs {
        let group: Vec<&&RetrievalResult> = selected
            .iter()
            .filter(|r| r.document_id == *doc_id)
            .collect();
        if group.is_empty() {
            continue;
        }
        if !block.is_empty() {
            block.push('\n');
        }
        block.push_str(&header(&group[0].file_name, doc_id));
        block.push('\n');
        for result in group {
            block.push_str(&result.text);
            block.push('\n');
        }
    }

    block
}

fn header(file_name: &str, document_id: &str) -> String {
    format!("[Source: {} ({})]", file_name, document_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(doc: &str, file: &str, index: i64, text: &str, score: f64) -> RetrievalResult {
        RetrievalResult {
            chunk_id: format!("{}-{}", doc, index),
            document_id: doc.to_string(),
            file_name: file.to_string(),
            chunk_index: index,
            text: text.to_string(),
            score,
        }
    }

    #[test]
    fn test_empty_input_empty_block() {
        assert_eq!(assemble_context(&[], 1000), "");
    }

    #[test]
    fn test_groups_by_document_with_provenance() {
        let results = vec![
            result("d1", "notes.md", 0, "alpha", 0.9),
            result("d2", "report.pdf", 3, "beta", 0.8),
            result("d1", "notes.md", 5, "gamma", 0.7),
        ];
        let block = assemble_context(&results, 10_000);

        assert!(block.contains("[Source: notes.md (d1)]"));
        assert!(block.contains("[Source: report.pdf (d2)]"));
        // d1 chunks grouped together even though d2 ranked between them
        let d1_pos = block.find("(d1)").unwrap();
        let gamma_pos = block.find("gamma").unwrap();
        let d2_pos = block.find("(d2)").unwrap();
        assert!(d1_pos < gamma_pos);
        assert!(gamma_pos < d2_pos);
    }

    #[test]
    fn test_budget_drops_lowest_ranked_whole_chunks() {
        let results = vec![
            result("d1", "a.txt", 0, &"x".repeat(50), 0.9),
            result("d2", "b.txt", 0, &"y".repeat(50), 0.8),
            result("d3", "c.txt", 0, &"z".repeat(50), 0.7),
        ];
        // Budget fits the first chunk plus its header, not the second
        let first_cost = 50 + 1 + "[Source: a.txt (d1)]".len() + 1;
        let block = assemble_context(&results, first_cost + 10);

        assert!(block.contains("xxxxx"));
        assert!(!block.contains("yyyyy"));
        assert!(!block.contains("zzzzz"));
        // Dropped chunks leave no partial text behind
        assert!(!block.contains('y'));
    }

    #[test]
    fn test_group_separator_counted_against_budget() {
        let results = vec![
            result("d1", "a.txt", 0, &"x".repeat(50), 0.9),
            result("d2", "b.txt", 0, &"y".repeat(50), 0.8),
        ];
        // Per document: header + newline + text + newline, plus one blank
        // line between the two groups.
        let exact = 2 * ("[Source: a.txt (d1)]".len() + 1 + 50 + 1) + 1;

        let block = assemble_context(&results, exact);
        assert_eq!(block.chars().count(), exact);
        assert!(block.contains("yyyyy"));

        // One char short of the separator drops the whole second chunk.
        let smaller = assemble_context(&results, exact - 1);
        assert!(smaller.contains("xxxxx"));
        assert!(!smaller.contains("yyyyy"));
        assert!(smaller.chars().count() < exact);
    }

    #[test]
    fn test_budget_too_small_for_anything_yields_empty() {
        let results = vec![result("d1", "a.txt", 0, &"x".repeat(500), 0.9)];
        assert_eq!(assemble_context(&results, 10), "");
    }

    #[test]
    fn test_block_stays_within_budget() {
        let results: Vec<RetrievalResult> = (0..20)
            .map(|i| result(&format!("d{}", i), "f.txt", 0, &"t".repeat(100), 1.0 - i as f64 * 0.01))
            .collect();
        for budget in [0, 100, 244, 245, 250, 500, 1000, 5000] {
            let block = assemble_context(&results, budget);
            assert!(
                block.chars().count() <= budget,
                "budget {} exceeded: {}",
                budget,
                block.chars().count()
            );
        }
    }
}
